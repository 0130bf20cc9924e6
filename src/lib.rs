// Nebula signaling connection manager
// Keeps the peer-to-peer call layer's signaling session alive: init/teardown,
// reconnection, heartbeat and inbound event routing

pub mod config;
pub mod debug;
pub mod network;
pub mod signal;

pub use network::{start_signaling, SignalClient, SignalStatus};
pub use signal::{
    ErrorKind, Identity, IncomingCall, ManagerSettings, OutgoingCall, RecoveryState, SessionError,
    SignalError, SignalManager,
};
