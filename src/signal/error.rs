// Error taxonomy for the signaling layer
// Session errors come from the transport; SignalError is what the API returns

use std::fmt;

use thiserror::Error;

/// Classification of errors reported by a signaling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The targeted remote identity cannot be reached
    PeerUnavailable,
    /// Network error on the path to the relay
    Network,
    /// The relay rejected or failed the request
    ServerError,
    /// The signaling socket itself failed
    SocketError,
    Unknown,
}

impl ErrorKind {
    /// Map the relay's wire string onto a kind
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "peer-unavailable" => ErrorKind::PeerUnavailable,
            "network" => ErrorKind::Network,
            "server-error" => ErrorKind::ServerError,
            "socket-error" => ErrorKind::SocketError,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            ErrorKind::PeerUnavailable => "peer-unavailable",
            ErrorKind::Network => "network",
            ErrorKind::ServerError => "server-error",
            ErrorKind::SocketError => "socket-error",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Transport failures impair the local signaling channel and start recovery
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::ServerError | ErrorKind::SocketError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Error reported by a session through its `error` event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
    /// Remote identity the failed request was aimed at, when known
    pub target: Option<String>,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            target: None,
        }
    }

    pub fn peer_unavailable(target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            kind: ErrorKind::PeerUnavailable,
            message: format!("Could not connect to peer {}", target),
            target: Some(target),
        }
    }
}

/// Errors returned by the signaling API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("invalid identity {0:?}: must be a non-empty string")]
    InvalidIdentity(String),

    #[error("signaling session is not ready")]
    NotReady,

    #[error("session construction failed: {0}")]
    Construction(String),

    #[error("unknown peer connection {0}")]
    UnknownConnection(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("signaling runtime has shut down")]
    Closed,
}
