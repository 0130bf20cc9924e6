// Signaling session abstraction
// The supervisor drives any transport that implements Session; the relay-backed one lives in network::ws_session

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::warn;

use super::error::{SessionError, SignalError};
use super::identity::Identity;

/// Public STUN server used when the configuration names none
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Generation tag of a session. Every event carries the tag of the session that emitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Id of a media call, prefixed `mc_`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

/// Id of a peer data connection, prefixed `dc_`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerConnectionId(pub String);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PeerConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ICE server entry handed to the session (and on to the media layer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: impl Into<String>) -> Self {
        Self {
            urls: urls.into(),
            username: None,
            credential: None,
        }
    }

    pub fn is_stun(&self) -> bool {
        self.urls.starts_with("stun:")
    }
}

/// Options applied when a session is constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub ice_servers: Vec<IceServer>,
}

impl SessionOptions {
    /// Build options, guaranteeing at least one STUN server for NAT traversal
    pub fn new(mut ice_servers: Vec<IceServer>) -> Self {
        if !ice_servers.iter().any(IceServer::is_stun) {
            warn!(
                "No STUN server configured, falling back to {}",
                DEFAULT_STUN_SERVER
            );
            ice_servers.insert(0, IceServer::stun(DEFAULT_STUN_SERVER));
        }
        Self { ice_servers }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Lightweight payload pushed over a peer data connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    /// Synchronization payload delivered to the sync callback
    #[serde(rename = "SYNC")]
    Sync { payload: serde_json::Value },

    /// Any other message type; ignored by the sync channel
    #[serde(other)]
    Other,
}

/// Inbound call offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub peer: String,
    pub sdp: String,
}

/// Answer to a call this node placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAnswer {
    pub call_id: CallId,
    pub sdp: String,
}

/// Handle to a call this node placed. `answer` resolves when the remote side answers
/// and is dropped if the target turns out to be unreachable.
#[derive(Debug)]
pub struct OutgoingCall {
    pub call_id: CallId,
    pub target: Identity,
    pub answer: oneshot::Receiver<CallAnswer>,
}

/// Data connection opened by a remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnection {
    pub id: PeerConnectionId,
    pub peer: String,
}

/// Event vocabulary emitted by a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Registered with the relay under the given name
    Open(String),
    /// A remote peer requested a data connection
    Connection(PeerConnection),
    /// A data connection reported open
    DataOpen(PeerConnectionId),
    Data(PeerConnectionId, PeerMessage),
    DataClose(PeerConnectionId),
    Call(IncomingCall),
    /// The socket closed cleanly; the session can be resumed
    Disconnected,
    Error(SessionError),
    /// The session was destroyed and cannot be resumed
    Close,
}

/// Live signaling connection
pub trait Session: Send {
    fn is_open(&self) -> bool;
    fn is_disconnected(&self) -> bool;
    fn is_destroyed(&self) -> bool;

    /// Resume the signaling socket. No-op unless disconnected.
    fn reconnect(&mut self);

    /// Tear the session down, cascading to its data connections
    fn destroy(&mut self) -> Result<(), SessionError>;

    fn call(&mut self, target: &Identity, sdp: String) -> Result<OutgoingCall, SignalError>;
    fn answer(&mut self, call: &IncomingCall, sdp: String) -> Result<(), SignalError>;
    fn connect(&mut self, target: &Identity) -> Result<PeerConnectionId, SignalError>;
    fn send(&mut self, connection: &PeerConnectionId, message: PeerMessage)
        -> Result<(), SignalError>;

    /// Close a data connection from this side. The remote peer is told through the relay.
    fn close_connection(&mut self, connection: &PeerConnectionId) -> Result<(), SignalError>;
}

/// Constructs sessions for the supervisor
pub trait SessionFactory {
    type Session: Session;

    fn create(
        &mut self,
        id: SessionId,
        identity: &Identity,
        options: &SessionOptions,
    ) -> Result<Self::Session, SignalError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_always_carry_stun() {
        let options = SessionOptions::new(vec![IceServer {
            urls: "turn:turn.example.org:3478".to_string(),
            username: Some("u".to_string()),
            credential: Some("p".to_string()),
        }]);
        assert_eq!(options.ice_servers.len(), 2);
        assert_eq!(options.ice_servers[0].urls, DEFAULT_STUN_SERVER);

        let configured = SessionOptions::new(vec![IceServer::stun("stun:stun.example.org:3478")]);
        assert_eq!(configured.ice_servers.len(), 1);
    }

    #[test]
    fn test_peer_message_tags() {
        let sync: PeerMessage =
            serde_json::from_value(json!({"type": "SYNC", "payload": {"users": []}})).unwrap();
        assert_eq!(
            sync,
            PeerMessage::Sync {
                payload: json!({"users": []})
            }
        );

        let other: PeerMessage =
            serde_json::from_value(json!({"type": "TYPING", "payload": 1})).unwrap();
        assert_eq!(other, PeerMessage::Other);
    }
}
