// Relay-backed signaling session
// One tokio task per session owns the WebSocket; the Session handle talks to it over a command channel

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{PeerMessage, SignalingMessage};
use crate::signal::{
    CallAnswer, CallId, ErrorKind, Identity, IncomingCall, OutgoingCall, PeerConnection,
    PeerConnectionId, Session, SessionError, SessionEvent, SessionFactory, SessionId,
    SessionOptions, SignalError,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Channel every session pushes its tagged events into
pub type EventSender = mpsc::UnboundedSender<(SessionId, SessionEvent)>;

/// Generate a prefixed random id (`mc_` for calls, `dc_` for data connections)
fn generate_id(prefix: &str) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..12)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{}{}", prefix, suffix)
}

#[derive(Debug, Default)]
struct SessionFlags {
    open: AtomicBool,
    disconnected: AtomicBool,
    destroyed: AtomicBool,
}

impl SessionFlags {
    fn mark_open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.disconnected.store(false, Ordering::SeqCst);
    }

    fn mark_disconnected(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.disconnected.store(true, Ordering::SeqCst);
    }

    fn mark_destroyed(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Data connections known to a session, keyed by id, valued by remote peer
type ConnectionTable = Arc<Mutex<HashMap<PeerConnectionId, String>>>;

fn lock(table: &ConnectionTable) -> MutexGuard<'_, HashMap<PeerConnectionId, String>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
enum SocketCommand {
    Reconnect,
    Send(SignalingMessage),
    Call {
        offer: SignalingMessage,
        call_id: CallId,
        target: String,
        answer: oneshot::Sender<CallAnswer>,
    },
    SendData {
        connection_id: PeerConnectionId,
        message: PeerMessage,
    },
    CloseConnection {
        connection_id: PeerConnectionId,
        target: String,
    },
    Destroy,
}

/// Builds `WsSession`s against a fixed relay endpoint
pub struct WsSessionFactory {
    relay_url: String,
    events: EventSender,
}

impl WsSessionFactory {
    pub fn new(relay_url: impl Into<String>, events: EventSender) -> Self {
        Self {
            relay_url: relay_url.into(),
            events,
        }
    }
}

impl SessionFactory for WsSessionFactory {
    type Session = WsSession;

    fn create(
        &mut self,
        id: SessionId,
        identity: &Identity,
        options: &SessionOptions,
    ) -> Result<WsSession, SignalError> {
        self.relay_url
            .as_str()
            .into_client_request()
            .map_err(|e| SignalError::Construction(format!("bad relay url {}: {}", self.relay_url, e)))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SignalError::Construction(e.to_string()))?;

        for server in &options.ice_servers {
            debug!("ICE server for {}: {}", id, server.urls);
        }

        let flags = Arc::new(SessionFlags::default());
        let connections = ConnectionTable::default();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = SocketTask::new(
            id,
            identity.clone(),
            self.relay_url.clone(),
            flags.clone(),
            self.events.clone(),
            cmd_rx,
            connections.clone(),
        );
        runtime.spawn(task.run());

        Ok(WsSession {
            identity: identity.clone(),
            flags,
            commands: cmd_tx,
            connections,
        })
    }
}

/// Handle to a relay-backed session. Dropping it shuts the socket task down.
pub struct WsSession {
    identity: Identity,
    flags: Arc<SessionFlags>,
    commands: mpsc::UnboundedSender<SocketCommand>,
    connections: ConnectionTable,
}

impl WsSession {
    fn command(&self, cmd: SocketCommand) -> Result<(), SignalError> {
        self.commands.send(cmd).map_err(|_| {
            SignalError::Session(SessionError::new(
                ErrorKind::SocketError,
                "signaling socket task has ended",
            ))
        })
    }
}

impl Session for WsSession {
    fn is_open(&self) -> bool {
        self.flags.open.load(Ordering::SeqCst)
    }

    fn is_disconnected(&self) -> bool {
        self.flags.disconnected.load(Ordering::SeqCst)
    }

    fn is_destroyed(&self) -> bool {
        self.flags.destroyed.load(Ordering::SeqCst)
    }

    fn reconnect(&mut self) {
        if self.is_disconnected() && !self.is_destroyed() {
            let _ = self.command(SocketCommand::Reconnect);
        }
    }

    fn destroy(&mut self) -> Result<(), SessionError> {
        if self.is_destroyed() {
            return Ok(());
        }
        self.flags.mark_destroyed();
        lock(&self.connections).clear();
        self.commands
            .send(SocketCommand::Destroy)
            .map_err(|_| SessionError::new(ErrorKind::SocketError, "signaling socket task has ended"))
    }

    fn call(&mut self, target: &Identity, sdp: String) -> Result<OutgoingCall, SignalError> {
        let call_id = CallId(generate_id("mc_"));
        let (answer_tx, answer_rx) = oneshot::channel();
        self.command(SocketCommand::Call {
            offer: SignalingMessage::Offer {
                target: target.to_string(),
                from: self.identity.to_string(),
                call_id: call_id.0.clone(),
                sdp,
            },
            call_id: call_id.clone(),
            target: target.to_string(),
            answer: answer_tx,
        })?;
        Ok(OutgoingCall {
            call_id,
            target: target.clone(),
            answer: answer_rx,
        })
    }

    fn answer(&mut self, call: &IncomingCall, sdp: String) -> Result<(), SignalError> {
        self.command(SocketCommand::Send(SignalingMessage::Answer {
            target: call.peer.clone(),
            from: self.identity.to_string(),
            call_id: call.call_id.0.clone(),
            sdp,
        }))
    }

    fn connect(&mut self, target: &Identity) -> Result<PeerConnectionId, SignalError> {
        let connection_id = PeerConnectionId(generate_id("dc_"));
        lock(&self.connections).insert(connection_id.clone(), target.to_string());
        self.command(SocketCommand::Send(SignalingMessage::Connect {
            target: target.to_string(),
            from: self.identity.to_string(),
            connection_id: connection_id.0.clone(),
        }))?;
        Ok(connection_id)
    }

    fn send(&mut self, connection: &PeerConnectionId, message: PeerMessage) -> Result<(), SignalError> {
        if !lock(&self.connections).contains_key(connection) {
            return Err(SignalError::UnknownConnection(connection.to_string()));
        }
        self.command(SocketCommand::SendData {
            connection_id: connection.clone(),
            message,
        })
    }

    fn close_connection(&mut self, connection: &PeerConnectionId) -> Result<(), SignalError> {
        let Some(target) = lock(&self.connections).remove(connection) else {
            return Err(SignalError::UnknownConnection(connection.to_string()));
        };
        self.command(SocketCommand::CloseConnection {
            connection_id: connection.clone(),
            target,
        })
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        // Closing the command channel ends the socket task
        self.flags.mark_destroyed();
    }
}

enum SocketExit {
    /// Destroyed locally; the task ends
    Destroyed,
    /// Link lost; the session waits for a reconnect request
    Lost(SessionEvent),
    /// First registration refused; the session cannot be resumed
    Rejected(SessionError),
}

struct SocketTask {
    id: SessionId,
    identity: Identity,
    url: String,
    flags: Arc<SessionFlags>,
    events: EventSender,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    connections: ConnectionTable,
    inbound: HashSet<PeerConnectionId>,
    pending_calls: HashMap<CallId, (String, oneshot::Sender<CallAnswer>)>,
    // Set once the relay has accepted this identity
    registered: bool,
}

impl SocketTask {
    fn new(
        id: SessionId,
        identity: Identity,
        url: String,
        flags: Arc<SessionFlags>,
        events: EventSender,
        commands: mpsc::UnboundedReceiver<SocketCommand>,
        connections: ConnectionTable,
    ) -> Self {
        Self {
            id,
            identity,
            url,
            flags,
            events,
            commands,
            connections,
            inbound: HashSet::new(),
            pending_calls: HashMap::new(),
            registered: false,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send((self.id, event));
    }

    async fn run(mut self) {
        loop {
            match self.connect_and_serve().await {
                SocketExit::Destroyed => break,
                SocketExit::Lost(event) => {
                    self.flags.mark_disconnected();
                    self.on_link_lost();
                    if !self.drain_stale_commands() {
                        break;
                    }
                    self.emit(event);
                }
                SocketExit::Rejected(err) => {
                    warn!("Relay refused {}: {}", self.identity, err);
                    self.flags.mark_destroyed();
                    self.emit(SessionEvent::Error(err));
                    self.emit(SessionEvent::Close);
                    break;
                }
            }

            if !self.wait_for_reconnect().await {
                break;
            }
        }

        self.flags.mark_destroyed();
        debug!("Socket task for {} ended", self.id);
    }

    /// Everything routed through the relay died with the link: close inbound
    /// connections, forget outbound ones and fail calls still waiting for an answer
    fn on_link_lost(&mut self) {
        for id in std::mem::take(&mut self.inbound) {
            self.emit(SessionEvent::DataClose(id));
        }
        lock(&self.connections).clear();
        if !self.pending_calls.is_empty() {
            debug!("Dropping {} unanswered call(s)", self.pending_calls.len());
            self.pending_calls.clear();
        }
    }

    /// Discard reconnect requests queued while the last dial was in flight.
    /// Returns false if the session was destroyed meanwhile.
    fn drain_stale_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(SocketCommand::Reconnect) => {}
                Ok(SocketCommand::Destroy) => return false,
                Ok(other) => self.drop_while_down(other),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Park until asked to reconnect. Returns false when the session is destroyed instead.
    async fn wait_for_reconnect(&mut self) -> bool {
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                SocketCommand::Reconnect => return true,
                SocketCommand::Destroy => return false,
                other => self.drop_while_down(other),
            }
        }
        false
    }

    fn drop_while_down(&self, cmd: SocketCommand) {
        warn!("Dropping {:?} while signaling socket is down", cmd);
    }

    async fn connect_and_serve(&mut self) -> SocketExit {
        info!("🔌 Connecting to relay {} as {}", self.url, self.identity);

        let ws = match connect_async(self.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => return SocketExit::Lost(SessionEvent::Error(classify_connect_error(&e))),
        };
        let (mut sink, mut stream) = ws.split();

        let register = SignalingMessage::Register {
            peer_id: self.identity.to_string(),
        };
        if let Err(e) = send_frame(&mut sink, &register).await {
            return SocketExit::Lost(SessionEvent::Error(socket_error(e)));
        }

        // Wait for registration confirmation
        let peer_id = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                        Ok(SignalingMessage::RegisterOk { peer_id }) => break peer_id,
                        Ok(SignalingMessage::Error { kind, message, target }) => {
                            let _ = sink.close().await;
                            let err = SessionError {
                                kind: ErrorKind::from_wire(&kind),
                                message,
                                target,
                            };
                            // The relay may still hold our previous socket; stay resumable
                            if self.registered {
                                warn!("Relay refused re-registration of {}: {}", self.identity, err);
                                return SocketExit::Lost(SessionEvent::Error(err));
                            }
                            return SocketExit::Rejected(err);
                        }
                        Ok(other) => debug!("Ignoring {:?} before registration", other),
                        Err(e) => warn!("Failed to parse relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => return SocketExit::Lost(SessionEvent::Disconnected),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SocketExit::Lost(SessionEvent::Error(socket_error(e.into()))),
                },
                cmd = self.commands.recv() => match cmd {
                    None | Some(SocketCommand::Destroy) => {
                        let _ = sink.close().await;
                        return SocketExit::Destroyed;
                    }
                    Some(SocketCommand::Reconnect) => {}
                    Some(other) => self.drop_while_down(other),
                },
            }
        };

        info!("✅ Registered with relay as {}", peer_id);
        self.registered = true;
        self.flags.mark_open();
        self.emit(SessionEvent::Open(peer_id));

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                        Ok(msg) => {
                            if let Err(e) = self.handle_frame(msg, &mut sink).await {
                                return SocketExit::Lost(SessionEvent::Error(socket_error(e)));
                            }
                        }
                        Err(e) => warn!("Failed to parse relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Relay closed the signaling socket");
                        return SocketExit::Lost(SessionEvent::Disconnected);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SocketExit::Lost(SessionEvent::Error(socket_error(e.into()))),
                },
                cmd = self.commands.recv() => match cmd {
                    None | Some(SocketCommand::Destroy) => {
                        let _ = sink.close().await;
                        return SocketExit::Destroyed;
                    }
                    // Already connected
                    Some(SocketCommand::Reconnect) => {}
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(cmd, &mut sink).await {
                            return SocketExit::Lost(SessionEvent::Error(socket_error(e)));
                        }
                    }
                },
            }
        }
    }

    async fn handle_frame(&mut self, msg: SignalingMessage, sink: &mut WsSink) -> Result<()> {
        match msg {
            SignalingMessage::Offer {
                from, call_id, sdp, ..
            } => {
                self.emit(SessionEvent::Call(IncomingCall {
                    call_id: CallId(call_id),
                    peer: from,
                    sdp,
                }));
            }
            SignalingMessage::Answer {
                from, call_id, sdp, ..
            } => {
                let call_id = CallId(call_id);
                match self.pending_calls.remove(&call_id) {
                    Some((_, answer)) => {
                        info!("📥 Call {} answered by {}", call_id, from);
                        let _ = answer.send(CallAnswer { call_id, sdp });
                    }
                    None => debug!("Answer for unknown call {}", call_id),
                }
            }
            SignalingMessage::Connect {
                from,
                connection_id,
                ..
            } => {
                // Inbound data connections are accepted without further checks
                let id = PeerConnectionId(connection_id);
                lock(&self.connections).insert(id.clone(), from.clone());
                self.inbound.insert(id.clone());
                self.emit(SessionEvent::Connection(PeerConnection {
                    id: id.clone(),
                    peer: from.clone(),
                }));

                let accept = SignalingMessage::ConnectAccept {
                    target: from,
                    from: self.identity.to_string(),
                    connection_id: id.0.clone(),
                };
                send_frame(sink, &accept).await?;
                self.emit(SessionEvent::DataOpen(id));
            }
            SignalingMessage::ConnectAccept {
                from,
                connection_id,
                ..
            } => {
                info!("🔗 {} accepted data connection {}", from, connection_id);
            }
            SignalingMessage::Data {
                connection_id,
                payload,
                ..
            } => {
                let id = PeerConnectionId(connection_id);
                if !self.inbound.contains(&id) {
                    debug!("Ignoring data on connection {}", id);
                    return Ok(());
                }
                match serde_json::from_value::<PeerMessage>(payload) {
                    Ok(message) => self.emit(SessionEvent::Data(id, message)),
                    Err(e) => warn!("Malformed payload on {}: {}", id, e),
                }
            }
            SignalingMessage::CloseConnection { connection_id, .. } => {
                let id = PeerConnectionId(connection_id);
                lock(&self.connections).remove(&id);
                if self.inbound.remove(&id) {
                    self.emit(SessionEvent::DataClose(id));
                }
            }
            SignalingMessage::Error {
                kind,
                message,
                target,
            } => {
                let err = SessionError {
                    kind: ErrorKind::from_wire(&kind),
                    message,
                    target,
                };
                if let (ErrorKind::PeerUnavailable, Some(target)) = (err.kind, err.target.as_ref()) {
                    // Dropping the senders fails the caller's pending answer
                    self.pending_calls.retain(|_, (peer, _)| peer != target);
                    let inbound = &self.inbound;
                    lock(&self.connections)
                        .retain(|id, peer| peer != target || inbound.contains(id));
                }
                self.emit(SessionEvent::Error(err));
            }
            SignalingMessage::Register { .. } | SignalingMessage::RegisterOk { .. } => {
                debug!("Ignoring registration frame on open session");
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: SocketCommand, sink: &mut WsSink) -> Result<()> {
        match cmd {
            SocketCommand::Send(msg) => send_frame(sink, &msg).await?,
            SocketCommand::Call {
                offer,
                call_id,
                target,
                answer,
            } => {
                self.pending_calls.insert(call_id, (target, answer));
                send_frame(sink, &offer).await?;
            }
            SocketCommand::SendData {
                connection_id,
                message,
            } => {
                let peer = lock(&self.connections).get(&connection_id).cloned();
                match peer {
                    Some(target) => {
                        let data = SignalingMessage::Data {
                            target,
                            from: self.identity.to_string(),
                            connection_id: connection_id.0,
                            payload: serde_json::to_value(&message)?,
                        };
                        send_frame(sink, &data).await?;
                    }
                    None => warn!("Connection {} vanished before send", connection_id),
                }
            }
            SocketCommand::CloseConnection {
                connection_id,
                target,
            } => {
                if self.inbound.remove(&connection_id) {
                    self.emit(SessionEvent::DataClose(connection_id.clone()));
                }
                let close = SignalingMessage::CloseConnection {
                    target,
                    from: self.identity.to_string(),
                    connection_id: connection_id.0,
                };
                send_frame(sink, &close).await?;
            }
            SocketCommand::Reconnect | SocketCommand::Destroy => {}
        }
        Ok(())
    }
}

async fn send_frame(sink: &mut WsSink, msg: &SignalingMessage) -> Result<()> {
    sink.send(Message::Text(msg.to_json()?)).await?;
    Ok(())
}

fn socket_error(e: anyhow::Error) -> SessionError {
    SessionError::new(ErrorKind::SocketError, e.to_string())
}

fn classify_connect_error(e: &tungstenite::Error) -> SessionError {
    match e {
        tungstenite::Error::Http(response) => SessionError::new(
            ErrorKind::ServerError,
            format!("relay rejected handshake: {}", response.status()),
        ),
        other => SessionError::new(
            ErrorKind::Network,
            format!("could not reach relay: {}", other),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed() {
        let a = generate_id("dc_");
        let b = generate_id("dc_");
        assert!(a.starts_with("dc_"));
        assert_eq!(a.len(), 15);
        assert_ne!(a, b);
    }

    #[test]
    fn test_construction_needs_valid_url() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut factory = WsSessionFactory::new("not a url", tx);
        let identity = Identity::new("user_42").unwrap();
        let result = factory.create(SessionId(0), &identity, &SessionOptions::default());
        assert!(matches!(result, Err(SignalError::Construction(_))));
    }

    #[test]
    fn test_construction_needs_runtime() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut factory = WsSessionFactory::new("ws://127.0.0.1:9", tx);
        let identity = Identity::new("user_42").unwrap();
        let result = factory.create(SessionId(0), &identity, &SessionOptions::default());
        assert!(matches!(result, Err(SignalError::Construction(_))));
    }

    fn task() -> (
        SocketTask,
        mpsc::UnboundedSender<SocketCommand>,
        mpsc::UnboundedReceiver<(SessionId, SessionEvent)>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = SocketTask::new(
            SessionId(3),
            Identity::new("user_42").unwrap(),
            "ws://127.0.0.1:9".to_string(),
            Arc::new(SessionFlags::default()),
            event_tx,
            cmd_rx,
            ConnectionTable::default(),
        );
        (task, cmd_tx, event_rx)
    }

    #[test]
    fn test_link_loss_closes_connections_and_calls() {
        let (mut task, _cmd_tx, mut events) = task();
        let inbound = PeerConnectionId("dc_in".to_string());
        let outbound = PeerConnectionId("dc_out".to_string());
        lock(&task.connections).insert(inbound.clone(), "user_7".to_string());
        lock(&task.connections).insert(outbound, "user_8".to_string());
        task.inbound.insert(inbound.clone());
        let (answer_tx, mut answer_rx) = oneshot::channel();
        task.pending_calls
            .insert(CallId("mc_1".to_string()), ("user_8".to_string(), answer_tx));

        task.on_link_lost();

        assert_eq!(
            events.try_recv().unwrap(),
            (SessionId(3), SessionEvent::DataClose(inbound))
        );
        assert!(events.try_recv().is_err());
        assert!(lock(&task.connections).is_empty());
        assert!(task.inbound.is_empty());
        assert!(answer_rx.try_recv().is_err());
    }

    #[test]
    fn test_stale_reconnects_are_drained() {
        let (mut task, cmd_tx, _events) = task();
        cmd_tx.send(SocketCommand::Reconnect).unwrap();
        cmd_tx.send(SocketCommand::Reconnect).unwrap();

        assert!(task.drain_stale_commands());
        assert!(task.commands.try_recv().is_err());

        cmd_tx.send(SocketCommand::Reconnect).unwrap();
        cmd_tx.send(SocketCommand::Destroy).unwrap();
        assert!(!task.drain_stale_commands());
    }

    #[test]
    fn test_connect_error_classification() {
        let io = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(classify_connect_error(&io).kind, ErrorKind::Network);
    }
}
