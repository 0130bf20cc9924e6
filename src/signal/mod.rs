// Signaling connection manager
// Supervisor, reconnection policy, event multiplexer and heartbeat for the call layer

pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod multiplexer;
pub mod recovery;
pub mod session;
pub mod supervisor;

pub use error::{ErrorKind, SessionError, SignalError};
pub use identity::Identity;
pub use recovery::RecoveryState;
pub use session::{
    CallAnswer, CallId, IceServer, IncomingCall, OutgoingCall, PeerConnection, PeerConnectionId,
    PeerMessage, Session, SessionEvent, SessionFactory, SessionId, SessionOptions,
};
pub use supervisor::{ManagerSettings, SignalManager};
