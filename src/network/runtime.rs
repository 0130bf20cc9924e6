// Signaling runtime - drives the SignalManager from a tokio task
// Session events, client commands and timer deadlines are multiplexed onto one task,
// so manager handlers never run concurrently

use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tracing::{debug, info};

use super::client::{ClientCommand, SignalStatus};
use crate::signal::{SessionEvent, SessionFactory, SessionId, SignalManager};

/// Spawn the driver task onto the current tokio runtime
pub fn spawn_manager<F>(
    manager: SignalManager<F>,
    events: mpsc::UnboundedReceiver<(SessionId, SessionEvent)>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
) where
    F: SessionFactory + Send + 'static,
{
    tokio::spawn(run_manager(manager, events, commands));
}

/// Main event loop. Ends when every client handle is dropped.
pub async fn run_manager<F: SessionFactory>(
    mut manager: SignalManager<F>,
    mut events: mpsc::UnboundedReceiver<(SessionId, SessionEvent)>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
) {
    debug!("Signaling driver started");

    loop {
        let deadline = manager.poll_timeout();
        let wake = deadline
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(tokio::time::Instant::now);

        tokio::select! {
            Some((id, event)) = events.recv() => {
                manager.handle_event(id, event, Instant::now());
            }
            cmd = commands.recv() => match cmd {
                Some(cmd) => handle_command(&mut manager, cmd),
                None => break,
            },
            _ = sleep_until(wake), if deadline.is_some() => {
                manager.handle_timeout(Instant::now());
            }
        }
    }

    info!("All signaling clients dropped, shutting down");
    manager.cleanup();
}

fn handle_command<F: SessionFactory>(manager: &mut SignalManager<F>, cmd: ClientCommand) {
    let now = Instant::now();
    match cmd {
        ClientCommand::Init(identity) => manager.init(identity, now),
        ClientCommand::Cleanup => manager.cleanup(),
        ClientCommand::IsReady(reply) => {
            let _ = reply.send(manager.is_ready());
        }
        ClientCommand::Status(reply) => {
            let _ = reply.send(SignalStatus {
                ready: manager.is_ready(),
                identity: manager.identity().cloned(),
                recovery: manager.recovery_state(),
                recovery_attempts: manager.recovery_attempts(),
                tracked_connections: manager.tracked_connections(),
                sessions_created: manager.sessions_created(),
            });
        }
        ClientCommand::SetOnIncomingCall(handler) => manager.set_on_incoming_call(handler),
        ClientCommand::SetOnError(handler) => manager.set_on_error(handler),
        ClientCommand::SetSyncCallback(handler) => manager.set_sync_callback(handler),
        ClientCommand::PlaceCall { target, sdp, reply } => {
            let _ = reply.send(manager.place_call(&target, sdp));
        }
        ClientCommand::AnswerCall { call, sdp, reply } => {
            let _ = reply.send(manager.answer_call(&call, sdp));
        }
        ClientCommand::Connect { target, reply } => {
            let _ = reply.send(manager.connect(&target));
        }
        ClientCommand::SendSync {
            connection,
            payload,
            reply,
        } => {
            let _ = reply.send(manager.send_sync(&connection, payload));
        }
        ClientCommand::CloseConnection { connection, reply } => {
            let _ = reply.send(manager.close_connection(&connection));
        }
    }
}
