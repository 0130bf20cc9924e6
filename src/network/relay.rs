// Nebula signaling relay
// Registers peers by identity and relays call offers/answers and data-connection frames between them

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use super::protocol::SignalingMessage;
use crate::signal::{ErrorKind, SessionError};

type PeerId = String;
type PeerConnections = HashMap<PeerId, mpsc::UnboundedSender<Message>>;

/// Data connections the relay has seen requested, keyed by connection id
type DataLinks = HashMap<String, (PeerId, PeerId)>;

#[derive(Default)]
struct RelayState {
    peers: RwLock<PeerConnections>,
    links: RwLock<DataLinks>,
}

type SharedState = Arc<RelayState>;

/// Accept signaling sockets until the listener fails
pub async fn serve(listener: TcpListener) -> anyhow::Result<()> {
    info!("🚀 Signaling relay listening on {}", listener.local_addr()?);

    let state = SharedState::default();

    loop {
        let (stream, addr) = listener.accept().await?;
        tokio::spawn(handle_connection(stream, addr, state.clone()));
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: SharedState) {
    info!("📥 New connection from {}", addr);

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut peer_id: Option<PeerId> = None;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                error!("Error receiving message: {}", e);
                break;
            }
        };

        if let Message::Text(text) = msg {
            match SignalingMessage::from_json(&text) {
                Ok(signal_msg) => {
                    handle_signaling_message(signal_msg, &mut peer_id, &tx, &state, addr).await;
                }
                Err(e) => {
                    warn!("Failed to parse message: {}", e);
                    reply(
                        &tx,
                        &SignalingMessage::error(
                            ErrorKind::ServerError,
                            format!("Invalid message format: {}", e),
                        ),
                    );
                }
            }
        }
    }

    if let Some(id) = peer_id {
        state.peers.write().await.remove(&id);
        info!("📤 Peer {} disconnected", id);
        close_links_of(&state, &id).await;
    }

    send_task.abort();
}

async fn handle_signaling_message(
    mut msg: SignalingMessage,
    peer_id: &mut Option<PeerId>,
    tx: &mpsc::UnboundedSender<Message>,
    state: &RelayState,
    addr: SocketAddr,
) {
    if let SignalingMessage::Register { peer_id: new_id } = msg {
        let mut registry = state.peers.write().await;
        if peer_id.is_some() || registry.contains_key(&new_id) {
            warn!("Rejecting registration of {} from {}", new_id, addr);
            reply(
                tx,
                &SignalingMessage::Error {
                    kind: "unavailable-id".to_string(),
                    message: format!("ID \"{}\" is taken", new_id),
                    target: None,
                },
            );
            return;
        }

        info!("✅ Peer registered: {} from {}", new_id, addr);
        registry.insert(new_id.clone(), tx.clone());
        *peer_id = Some(new_id.clone());
        reply(tx, &SignalingMessage::RegisterOk { peer_id: new_id });
        return;
    }

    let Some(sender) = peer_id.as_deref() else {
        reply(
            tx,
            &SignalingMessage::error(ErrorKind::ServerError, "Register before relaying messages"),
        );
        return;
    };

    let Some(target) = msg.target().map(str::to_string) else {
        warn!("Unhandled message type from {}", sender);
        return;
    };

    msg.stamp_sender(sender);
    info!("📨 Relaying {} -> {}", sender, target);
    if !relay_message(&state.peers, &target, &msg).await {
        warn!("Target peer {} not found", target);
        let err = SessionError::peer_unavailable(target);
        reply(
            tx,
            &SignalingMessage::Error {
                kind: err.kind.as_wire().to_string(),
                message: err.message,
                target: err.target,
            },
        );
        return;
    }

    match msg {
        SignalingMessage::Connect { connection_id, .. } => {
            state
                .links
                .write()
                .await
                .insert(connection_id, (sender.to_string(), target));
        }
        SignalingMessage::CloseConnection { connection_id, .. } => {
            state.links.write().await.remove(&connection_id);
        }
        _ => {}
    }
}

/// Tell every counterpart of `gone` that its data connections are closed
async fn close_links_of(state: &RelayState, gone: &str) {
    let closed: Vec<(String, PeerId)> = {
        let mut links = state.links.write().await;
        let ids: Vec<String> = links
            .iter()
            .filter(|(_, (a, b))| a == gone || b == gone)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                let (a, b) = links.remove(&id)?;
                let other = if a == gone { b } else { a };
                Some((id, other))
            })
            .collect()
    };

    for (connection_id, other) in closed {
        let msg = SignalingMessage::CloseConnection {
            target: other.clone(),
            from: gone.to_string(),
            connection_id,
        };
        relay_message(&state.peers, &other, &msg).await;
    }
}

/// Forward to the target's socket. Returns false if the target is not registered.
async fn relay_message(
    peers: &RwLock<PeerConnections>,
    target: &str,
    msg: &SignalingMessage,
) -> bool {
    let peers_lock = peers.read().await;
    let Some(peer_tx) = peers_lock.get(target) else {
        return false;
    };
    match msg.to_json() {
        Ok(json) => {
            if peer_tx.send(Message::Text(json)).is_err() {
                error!("Failed to send message to peer {}", target);
            }
        }
        Err(e) => error!("Failed to encode message for {}: {}", target, e),
    }
    true
}

fn reply(tx: &mpsc::UnboundedSender<Message>, msg: &SignalingMessage) {
    if let Ok(json) = msg.to_json() {
        let _ = tx.send(Message::Text(json));
    }
}
