// Configuration file loading and creation

use super::types::Config;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Get the path to the configuration file
pub fn get_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("nebula");
    path.push("signal.toml");
    path
}

/// Load configuration from the default location, creating it if it doesn't exist
pub fn load_config() -> Result<Config, io::Error> {
    let config_path = get_config_path();

    if config_path.exists() {
        load_config_from(&config_path)
    } else {
        create_default_config(&config_path)?;
        Ok(Config::default())
    }
}

/// Load configuration from `path`. A file that fails to parse falls back to defaults.
pub fn load_config_from(path: &Path) -> Result<Config, io::Error> {
    let contents = fs::read_to_string(path)?;
    match toml::from_str(&contents) {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!("Failed to parse config file {}: {}", path.display(), e);
            warn!("Using default configuration");
            Ok(Config::default())
        }
    }
}

/// Create a default configuration file with helpful comments
pub fn create_default_config(path: &Path) -> Result<(), io::Error> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let commented_toml = format!(
        "# Nebula signaling configuration\n\
         # Restart the client after editing for changes to take effect\n\
         #\n\
         # relay_url: ws:// or wss:// endpoint of the signaling relay\n\
         # ice_servers: STUN/TURN entries; a public STUN server is always included\n\
         # timing values are in milliseconds\n\n\
         {}",
        toml_string
    );

    fs::write(path, commented_toml)?;
    info!("Created default config file at: {}", path.display());
    Ok(())
}
