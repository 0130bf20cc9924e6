// Networking for the Nebula signaling layer
// Relay protocol, WebSocket-backed sessions, the driver task and the relay itself

pub mod client;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod ws_session;

pub use client::{SignalClient, SignalStatus};
pub use protocol::SignalingMessage;

use tokio::sync::mpsc;

use crate::signal::{ManagerSettings, SignalManager};
use ws_session::WsSessionFactory;

/// Start the signaling layer against the relay at `relay_url`.
/// Must be called from within a tokio runtime.
pub fn start_signaling(relay_url: &str, settings: ManagerSettings) -> SignalClient {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let session_options = settings.session_options.clone();
    let manager = SignalManager::new(WsSessionFactory::new(relay_url, event_tx), settings);
    runtime::spawn_manager(manager, event_rx, cmd_rx);

    SignalClient::new(cmd_tx, session_options)
}
