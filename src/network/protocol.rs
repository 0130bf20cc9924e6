// Nebula relay protocol definition
// JSON text frames exchanged between signaling sessions and the relay

use serde::{Deserialize, Serialize};

use crate::signal::ErrorKind;

pub use crate::signal::PeerMessage;

/// Messages exchanged with the relay.
///
/// `from` is stamped by the relay with the sender's registered id, so clients may leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Register this socket under a peer id
    Register { peer_id: String },

    /// Relay response to registration
    RegisterOk { peer_id: String },

    /// Call offer
    Offer {
        target: String,
        #[serde(default)]
        from: String,
        call_id: String,
        sdp: String,
    },

    /// Call answer
    Answer {
        target: String,
        #[serde(default)]
        from: String,
        call_id: String,
        sdp: String,
    },

    /// Request a data connection with the target
    Connect {
        target: String,
        #[serde(default)]
        from: String,
        connection_id: String,
    },

    /// Target accepted the data connection
    ConnectAccept {
        target: String,
        #[serde(default)]
        from: String,
        connection_id: String,
    },

    /// Payload on an open data connection
    Data {
        target: String,
        #[serde(default)]
        from: String,
        connection_id: String,
        payload: serde_json::Value,
    },

    CloseConnection {
        target: String,
        #[serde(default)]
        from: String,
        connection_id: String,
    },

    /// Error response
    Error {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

impl SignalingMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        SignalingMessage::Error {
            kind: kind.as_wire().to_string(),
            message: message.into(),
            target: None,
        }
    }

    /// Peer a relayed message is addressed to
    pub fn target(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { target, .. }
            | SignalingMessage::Answer { target, .. }
            | SignalingMessage::Connect { target, .. }
            | SignalingMessage::ConnectAccept { target, .. }
            | SignalingMessage::Data { target, .. }
            | SignalingMessage::CloseConnection { target, .. } => Some(target),
            SignalingMessage::Register { .. }
            | SignalingMessage::RegisterOk { .. }
            | SignalingMessage::Error { .. } => None,
        }
    }

    /// Overwrite the sender on relayed messages
    pub fn stamp_sender(&mut self, sender: &str) {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::Connect { from, .. }
            | SignalingMessage::ConnectAccept { from, .. }
            | SignalingMessage::Data { from, .. }
            | SignalingMessage::CloseConnection { from, .. } => *from = sender.to_string(),
            SignalingMessage::Register { .. }
            | SignalingMessage::RegisterOk { .. }
            | SignalingMessage::Error { .. } => {}
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
