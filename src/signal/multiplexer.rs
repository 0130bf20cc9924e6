// Event multiplexer
// Routes inbound session events to one consumer callback per category and tracks open peer data connections

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};

use super::error::SessionError;
use super::session::{IncomingCall, PeerConnection, PeerConnectionId, PeerMessage};

pub type IncomingCallHandler = Box<dyn FnMut(IncomingCall) + Send>;
pub type ErrorHandler = Box<dyn FnMut(&SessionError) + Send>;
pub type SyncHandler = Box<dyn FnMut(Value) + Send>;

#[derive(Default)]
pub struct EventMultiplexer {
    on_incoming_call: Option<IncomingCallHandler>,
    on_error: Option<ErrorHandler>,
    on_sync: Option<SyncHandler>,

    // Requested but not yet open
    pending: HashMap<PeerConnectionId, PeerConnection>,
    // Only connections that reported open
    open: HashMap<PeerConnectionId, PeerConnection>,
}

impl EventMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_incoming_call(&mut self, handler: IncomingCallHandler) {
        self.on_incoming_call = Some(handler);
    }

    pub fn set_on_error(&mut self, handler: ErrorHandler) {
        self.on_error = Some(handler);
    }

    pub fn set_sync_callback(&mut self, handler: SyncHandler) {
        self.on_sync = Some(handler);
    }

    pub fn dispatch_call(&mut self, call: IncomingCall) {
        match self.on_incoming_call.as_mut() {
            Some(handler) => handler(call),
            None => debug!("📵 No incoming-call handler, dropping offer {}", call.call_id),
        }
    }

    pub fn dispatch_error(&mut self, err: &SessionError) {
        if let Some(handler) = self.on_error.as_mut() {
            handler(err);
        }
    }

    /// A remote peer asked for a data connection; admitted without checks
    pub fn on_connection(&mut self, conn: PeerConnection) {
        debug!("Data connection {} requested by {}", conn.id, conn.peer);
        self.pending.insert(conn.id.clone(), conn);
    }

    pub fn on_data_open(&mut self, id: PeerConnectionId) {
        if let Some(conn) = self.pending.remove(&id) {
            info!("🔗 Data connection {} open with {}", conn.id, conn.peer);
            self.open.insert(id, conn);
        }
    }

    pub fn on_data(&mut self, id: &PeerConnectionId, message: PeerMessage) {
        if !self.open.contains_key(id) {
            debug!("Ignoring data on untracked connection {}", id);
            return;
        }
        match message {
            PeerMessage::Sync { payload } => {
                if let Some(handler) = self.on_sync.as_mut() {
                    handler(payload);
                }
            }
            PeerMessage::Other => {}
        }
    }

    pub fn on_data_close(&mut self, id: &PeerConnectionId) {
        self.pending.remove(id);
        if let Some(conn) = self.open.remove(id) {
            info!("Data connection {} with {} closed", conn.id, conn.peer);
        }
    }

    /// Forget every connection without closing them; the session teardown cascades
    pub fn clear_connections(&mut self) {
        self.pending.clear();
        self.open.clear();
    }

    pub fn open_connections(&self) -> usize {
        self.open.len()
    }

    pub fn is_tracked(&self, id: &PeerConnectionId) -> bool {
        self.open.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn conn(id: &str) -> PeerConnection {
        PeerConnection {
            id: PeerConnectionId(id.to_string()),
            peer: "user_7".to_string(),
        }
    }

    fn open(mux: &mut EventMultiplexer, id: &str) {
        mux.on_connection(conn(id));
        mux.on_data_open(PeerConnectionId(id.to_string()));
    }

    #[test]
    fn test_connection_counted_only_once_open() {
        let mut mux = EventMultiplexer::new();
        mux.on_connection(conn("dc_a"));
        assert_eq!(mux.open_connections(), 0);
        mux.on_data_open(PeerConnectionId("dc_a".to_string()));
        assert_eq!(mux.open_connections(), 1);
        // Closing before open never lands in the set
        mux.on_connection(conn("dc_b"));
        mux.on_data_close(&PeerConnectionId("dc_b".to_string()));
        mux.on_data_open(PeerConnectionId("dc_b".to_string()));
        assert_eq!(mux.open_connections(), 1);
    }

    #[test]
    fn test_sync_routing_ignores_other_types() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();

        let mut mux = EventMultiplexer::new();
        mux.set_sync_callback(Box::new(move |payload| sink.lock().unwrap().push(payload)));
        open(&mut mux, "dc_a");

        let id = PeerConnectionId("dc_a".to_string());
        mux.on_data(&id, PeerMessage::Sync { payload: json!({"rev": 1}) });
        mux.on_data(&id, PeerMessage::Other);
        mux.on_data(
            &PeerConnectionId("dc_unknown".to_string()),
            PeerMessage::Sync { payload: json!({"rev": 2}) },
        );

        assert_eq!(*received.lock().unwrap(), vec![json!({"rev": 1})]);
    }

    #[test]
    fn test_last_registration_wins() {
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));
        let (a, b) = (first.clone(), second.clone());

        let mut mux = EventMultiplexer::new();
        mux.set_on_error(Box::new(move |_| *a.lock().unwrap() += 1));
        mux.set_on_error(Box::new(move |_| *b.lock().unwrap() += 1));
        mux.dispatch_error(&SessionError::peer_unavailable("user_7"));

        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);
    }
}
