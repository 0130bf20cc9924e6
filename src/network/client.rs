// Signaling client interface for the application shell
// Provides channels to communicate with the task that owns the SignalManager

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::signal::multiplexer::{ErrorHandler, IncomingCallHandler, SyncHandler};
use crate::signal::{
    Identity, IncomingCall, OutgoingCall, PeerConnectionId, RecoveryState, SessionError,
    SessionOptions, SignalError,
};

type Reply<T> = oneshot::Sender<Result<T, SignalError>>;

/// Commands the application shell sends to the signaling task
pub enum ClientCommand {
    Init(Identity),
    Cleanup,
    IsReady(oneshot::Sender<bool>),
    Status(oneshot::Sender<SignalStatus>),

    SetOnIncomingCall(IncomingCallHandler),
    SetOnError(ErrorHandler),
    SetSyncCallback(SyncHandler),

    PlaceCall {
        target: Identity,
        sdp: String,
        reply: Reply<OutgoingCall>,
    },
    AnswerCall {
        call: IncomingCall,
        sdp: String,
        reply: Reply<()>,
    },
    Connect {
        target: Identity,
        reply: Reply<PeerConnectionId>,
    },
    SendSync {
        connection: PeerConnectionId,
        payload: Value,
        reply: Reply<()>,
    },
    CloseConnection {
        connection: PeerConnectionId,
        reply: Reply<()>,
    },
}

/// Snapshot of the manager's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalStatus {
    pub ready: bool,
    pub identity: Option<Identity>,
    pub recovery: RecoveryState,
    pub recovery_attempts: u32,
    pub tracked_connections: usize,
    pub sessions_created: u64,
}

/// Handle for the application shell. Cheap to clone; the signaling task lives
/// as long as any handle does.
#[derive(Clone)]
pub struct SignalClient {
    tx: mpsc::UnboundedSender<ClientCommand>,
    session_options: SessionOptions,
}

impl SignalClient {
    /// Create a new client (called by start_signaling)
    pub fn new(tx: mpsc::UnboundedSender<ClientCommand>, session_options: SessionOptions) -> Self {
        Self {
            tx,
            session_options,
        }
    }

    fn send(&self, cmd: ClientCommand) -> Result<(), SignalError> {
        self.tx.send(cmd).map_err(|_| SignalError::Closed)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> ClientCommand) -> Result<T, SignalError> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply))?;
        response.await.map_err(|_| SignalError::Closed)?
    }

    /// Bring the signaling session up for `identity`
    pub fn init(&self, identity: &str) -> Result<(), SignalError> {
        self.send(ClientCommand::Init(Identity::new(identity)?))
    }

    /// Tear the session down (logout)
    pub fn cleanup(&self) -> Result<(), SignalError> {
        self.send(ClientCommand::Cleanup)
    }

    /// Whether calls and data connections may be attempted. False once the task is gone.
    pub async fn is_ready(&self) -> bool {
        let (reply, response) = oneshot::channel();
        if self.send(ClientCommand::IsReady(reply)).is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    pub async fn status(&self) -> Result<SignalStatus, SignalError> {
        let (reply, response) = oneshot::channel();
        self.send(ClientCommand::Status(reply))?;
        response.await.map_err(|_| SignalError::Closed)
    }

    pub fn set_on_incoming_call<F>(&self, callback: F) -> Result<(), SignalError>
    where
        F: FnMut(IncomingCall) + Send + 'static,
    {
        self.send(ClientCommand::SetOnIncomingCall(Box::new(callback)))
    }

    pub fn set_on_error<F>(&self, callback: F) -> Result<(), SignalError>
    where
        F: FnMut(&SessionError) + Send + 'static,
    {
        self.send(ClientCommand::SetOnError(Box::new(callback)))
    }

    pub fn set_sync_callback<F>(&self, callback: F) -> Result<(), SignalError>
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.send(ClientCommand::SetSyncCallback(Box::new(callback)))
    }

    pub async fn place_call(&self, target: &str, sdp: String) -> Result<OutgoingCall, SignalError> {
        let target = Identity::new(target)?;
        self.request(|reply| ClientCommand::PlaceCall { target, sdp, reply })
            .await
    }

    pub async fn answer_call(&self, call: IncomingCall, sdp: String) -> Result<(), SignalError> {
        self.request(|reply| ClientCommand::AnswerCall { call, sdp, reply })
            .await
    }

    /// Open a data connection to `target`
    pub async fn connect(&self, target: &str) -> Result<PeerConnectionId, SignalError> {
        let target = Identity::new(target)?;
        self.request(|reply| ClientCommand::Connect { target, reply })
            .await
    }

    pub async fn send_sync(&self, connection: &PeerConnectionId, payload: Value) -> Result<(), SignalError> {
        let connection = connection.clone();
        self.request(|reply| ClientCommand::SendSync {
            connection,
            payload,
            reply,
        })
        .await
    }

    /// Close a data connection; the remote peer sees it close too
    pub async fn close_connection(&self, connection: &PeerConnectionId) -> Result<(), SignalError> {
        let connection = connection.clone();
        self.request(|reply| ClientCommand::CloseConnection { connection, reply })
            .await
    }

    /// ICE servers the media layer should use for calls placed through this client
    pub fn session_options(&self) -> &SessionOptions {
        &self.session_options
    }
}
