// Nebula signaling configuration types
// All settings with defaults matching the built-in timings

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::signal::session::DEFAULT_STUN_SERVER;
use crate::signal::{IceServer, ManagerSettings, SessionOptions};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Config {
    /// Manager settings derived from this configuration
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            init_debounce: Duration::from_millis(self.timing.init_debounce_ms),
            recovery_interval: timer_interval("recovery_interval_ms", self.timing.recovery_interval_ms),
            heartbeat_interval: timer_interval("heartbeat_interval_ms", self.timing.heartbeat_interval_ms),
            session_options: SessionOptions::new(self.signaling.ice_servers.clone()),
        }
    }
}

/// Shortest recovery or heartbeat period accepted from the config file
pub const MIN_TIMER_INTERVAL_MS: u64 = 100;

fn timer_interval(key: &str, ms: u64) -> Duration {
    if ms < MIN_TIMER_INTERVAL_MS {
        warn!(
            "timing.{} = {} is below {} ms, using {} ms",
            key, ms, MIN_TIMER_INTERVAL_MS, MIN_TIMER_INTERVAL_MS
        );
        return Duration::from_millis(MIN_TIMER_INTERVAL_MS);
    }
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalingConfig {
    // Relay WebSocket URL
    pub relay_url: String,

    // How long the shell waits for the session to become ready
    pub connection_timeout_secs: u64,

    // ICE/STUN servers handed to sessions; a public STUN server is added if none is listed
    pub ice_servers: Vec<IceServer>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".to_string(),
            connection_timeout_secs: 30,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    // Repeated init calls inside this window are ignored; 0 disables the debounce
    pub init_debounce_ms: u64,

    // Spacing of recovery ticks after a transport failure
    pub recovery_interval_ms: u64,

    // Spacing of idle-socket checks
    pub heartbeat_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            init_debounce_ms: 5_000,
            recovery_interval_ms: 10_000,
            heartbeat_interval_ms: 15_000,
        }
    }
}
