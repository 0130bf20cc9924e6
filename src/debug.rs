// Debug logging setup for the nebula-signal shell
// Routes tracing output to a log file when --debug is passed, stderr otherwise

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::Level;

pub const LOG_FILE_PATH: &str = "/tmp/nebula-signal-debug.log";

/// Install the global tracing subscriber
///
/// - `enabled = false`: INFO and above to stderr
/// - `enabled = true`: DEBUG and above to the log file, truncated with a header
pub fn init(enabled: bool) -> io::Result<()> {
    let result = if enabled {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(LOG_FILE_PATH)?;

        writeln!(file, "=== Nebula Signal Debug Log ===")?;
        writeln!(file, "Session started: {:?}", SystemTime::now())?;
        writeln!(file, "To monitor: tail -f {}", LOG_FILE_PATH)?;
        writeln!(file, "========================================\n")?;

        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_writer(io::stderr)
            .try_init()
    };

    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
