// Connection supervisor
// Owns the signaling session and drives init/teardown, recovery and heartbeat
//
// Sans-I/O: nothing in here reads a clock or spawns a timer. Callers pass `now`
// into every entry point and wake the manager at `poll_timeout()`.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::error::{SessionError, SignalError};
use super::heartbeat::{HeartbeatMonitor, DEFAULT_HEARTBEAT_INTERVAL};
use super::identity::Identity;
use super::multiplexer::EventMultiplexer;
use super::recovery::{RecoveryPolicy, RecoveryState, DEFAULT_RECOVERY_INTERVAL};
use super::session::{
    IncomingCall, OutgoingCall, PeerConnectionId, PeerMessage, Session, SessionEvent,
    SessionFactory, SessionId, SessionOptions,
};

/// Minimum spacing between accepted `init` calls
pub const DEFAULT_INIT_DEBOUNCE: Duration = Duration::from_secs(5);

/// Timing and session options for a `SignalManager`
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub init_debounce: Duration,
    pub recovery_interval: Duration,
    pub heartbeat_interval: Duration,
    pub session_options: SessionOptions,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            init_debounce: DEFAULT_INIT_DEBOUNCE,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            session_options: SessionOptions::default(),
        }
    }
}

/// Signaling connection manager. One per logged-in identity, owned by the
/// application's session layer.
pub struct SignalManager<F: SessionFactory> {
    factory: F,
    settings: ManagerSettings,

    identity: Option<Identity>,
    session: Option<(SessionId, F::Session)>,
    next_session_id: u64,
    last_init: Option<Instant>,

    recovery: RecoveryPolicy,
    heartbeat: HeartbeatMonitor,
    mux: EventMultiplexer,
}

impl<F: SessionFactory> SignalManager<F> {
    pub fn new(factory: F, settings: ManagerSettings) -> Self {
        Self {
            factory,
            recovery: RecoveryPolicy::new(settings.recovery_interval),
            heartbeat: HeartbeatMonitor::new(settings.heartbeat_interval),
            settings,
            identity: None,
            session: None,
            next_session_id: 0,
            last_init: None,
            mux: EventMultiplexer::new(),
        }
    }

    /// Bring up a session for `identity`.
    ///
    /// Debounced: calls within `init_debounce` of the last accepted call are ignored,
    /// as are calls for the identity the live session is already bound to.
    /// Construction failures are logged and leave the manager not ready.
    pub fn init(&mut self, identity: Identity, now: Instant) {
        if let Some(last) = self.last_init {
            if now.saturating_duration_since(last) < self.settings.init_debounce {
                debug!("Ignoring init for {} inside debounce window", identity);
                return;
            }
        }

        if self.session_is_live() && self.identity.as_ref() == Some(&identity) {
            debug!("Session for {} already live", identity);
            return;
        }

        self.identity = Some(identity);
        self.last_init = Some(now);
        self.cleanup();
        self.start_session(now);
    }

    /// Stop all timers, destroy the session and forget every data connection
    pub fn cleanup(&mut self) {
        self.heartbeat.stop();
        self.recovery.cancel();
        self.teardown_session();
    }

    /// True iff the session exists, is open, and is neither destroyed nor disconnected
    pub fn is_ready(&self) -> bool {
        match &self.session {
            Some((_, session)) => {
                !session.is_destroyed() && !session.is_disconnected() && session.is_open()
            }
            None => false,
        }
    }

    pub fn set_on_incoming_call<C>(&mut self, callback: C)
    where
        C: FnMut(IncomingCall) + Send + 'static,
    {
        self.mux.set_on_incoming_call(Box::new(callback));
    }

    pub fn set_on_error<C>(&mut self, callback: C)
    where
        C: FnMut(&SessionError) + Send + 'static,
    {
        self.mux.set_on_error(Box::new(callback));
    }

    pub fn set_sync_callback<C>(&mut self, callback: C)
    where
        C: FnMut(Value) + Send + 'static,
    {
        self.mux.set_sync_callback(Box::new(callback));
    }

    /// Feed one event emitted by the session tagged `id`
    pub fn handle_event(&mut self, id: SessionId, event: SessionEvent, now: Instant) {
        if self.current_session_id() != Some(id) {
            debug!("Dropping {:?} from stale {}", event, id);
            return;
        }

        match event {
            SessionEvent::Open(name) => {
                info!("📡 Signal node active: {}", name);
            }
            SessionEvent::Connection(conn) => self.mux.on_connection(conn),
            SessionEvent::DataOpen(conn_id) => self.mux.on_data_open(conn_id),
            SessionEvent::Data(conn_id, message) => self.mux.on_data(&conn_id, message),
            SessionEvent::DataClose(conn_id) => self.mux.on_data_close(&conn_id),
            SessionEvent::Call(call) => {
                info!("📞 Incoming call {} from {}", call.call_id, call.peer);
                self.mux.dispatch_call(call);
            }
            SessionEvent::Disconnected => {
                warn!("Signaling socket disconnected");
                if let Some((_, session)) = self.session.as_mut() {
                    if !session.is_destroyed() {
                        session.reconnect();
                    }
                }
            }
            SessionEvent::Error(err) => self.on_session_error(err, now),
            SessionEvent::Close => {
                warn!("Signaling session closed by transport");
                // Already destroyed, so there is nothing to tear down
                self.session = None;
                self.mux.clear_connections();
            }
        }
    }

    /// Run every timer that is due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.recovery.is_due(now) {
            self.on_recovery_tick(now);
        }
        if self.heartbeat.is_due(now) {
            self.on_heartbeat(now);
        }
    }

    /// Earliest instant at which `handle_timeout` has work to do
    pub fn poll_timeout(&self) -> Option<Instant> {
        match (self.recovery.next_tick(), self.heartbeat.next_beat()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn place_call(&mut self, target: &Identity, sdp: String) -> Result<OutgoingCall, SignalError> {
        let session = self.ready_session()?;
        info!("📤 Calling {}", target);
        session.call(target, sdp)
    }

    pub fn answer_call(&mut self, call: &IncomingCall, sdp: String) -> Result<(), SignalError> {
        let session = self.ready_session()?;
        session.answer(call, sdp)
    }

    /// Open a data connection to `target`
    pub fn connect(&mut self, target: &Identity) -> Result<PeerConnectionId, SignalError> {
        let session = self.ready_session()?;
        session.connect(target)
    }

    /// Push a synchronization payload over an existing data connection
    pub fn send_sync(&mut self, connection: &PeerConnectionId, payload: Value) -> Result<(), SignalError> {
        let session = self.ready_session()?;
        session.send(connection, PeerMessage::Sync { payload })
    }

    /// Close a data connection, inbound or outbound, and stop tracking it
    pub fn close_connection(&mut self, connection: &PeerConnectionId) -> Result<(), SignalError> {
        let session = self.ready_session()?;
        session.close_connection(connection)?;
        self.mux.on_data_close(connection);
        Ok(())
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery.attempts()
    }

    /// Number of peer data connections currently open
    pub fn tracked_connections(&self) -> usize {
        self.mux.open_connections()
    }

    /// Sessions constructed over the manager's lifetime
    pub fn sessions_created(&self) -> u64 {
        self.next_session_id
    }

    pub fn session_options(&self) -> &SessionOptions {
        &self.settings.session_options
    }

    fn current_session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|(id, _)| *id)
    }

    fn session_is_live(&self) -> bool {
        matches!(&self.session, Some((_, s)) if !s.is_destroyed() && s.is_open())
    }

    fn ready_session(&mut self) -> Result<&mut F::Session, SignalError> {
        if !self.is_ready() {
            return Err(SignalError::NotReady);
        }
        self.session
            .as_mut()
            .map(|(_, session)| session)
            .ok_or(SignalError::NotReady)
    }

    fn start_session(&mut self, now: Instant) {
        self.teardown_session();

        let Some(identity) = self.identity.clone() else {
            return;
        };
        self.last_init = Some(now);

        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        info!("🔌 Initializing signaling node {} ({})", identity, id);

        match self
            .factory
            .create(id, &identity, &self.settings.session_options)
        {
            Ok(session) => {
                self.session = Some((id, session));
                self.heartbeat.start(now);
            }
            Err(e) => {
                warn!("Signaling initialization failed: {}", e);
            }
        }
    }

    fn teardown_session(&mut self) {
        if let Some((id, mut session)) = self.session.take() {
            if let Err(e) = session.destroy() {
                debug!("Ignoring error while destroying {}: {}", id, e);
            }
        }
        self.mux.clear_connections();
    }

    fn on_session_error(&mut self, err: SessionError, now: Instant) {
        error!("Signal alert: {}", err);

        if err.kind.is_transport_failure() {
            self.attempt_recovery(now);
        }
        self.mux.dispatch_error(&err);
    }

    fn attempt_recovery(&mut self, now: Instant) {
        if self.identity.is_none() {
            return;
        }
        if self.recovery.begin(now) {
            info!("🔄 Initiating signal recovery");
        }
    }

    fn on_recovery_tick(&mut self, now: Instant) {
        self.recovery.advance(now);

        if self.is_ready() {
            info!(
                "✅ Signal recovery successful after {} attempt(s)",
                self.recovery.attempts()
            );
            self.recovery.settle();
            return;
        }

        let attempt = self.recovery.record_attempt();
        match self.session.as_mut() {
            Some((_, session)) if !session.is_destroyed() => {
                info!("Recovery attempt {}: resuming signaling socket", attempt);
                session.reconnect();
            }
            _ => {
                info!("Recovery attempt {}: rebuilding signaling session", attempt);
                self.start_session(now);
            }
        }
    }

    fn on_heartbeat(&mut self, now: Instant) {
        self.heartbeat.advance(now);

        // The recovery loop owns reconnects while it runs
        if self.recovery.is_recovering() {
            return;
        }
        if let Some((_, session)) = self.session.as_mut() {
            if session.is_disconnected() && !session.is_destroyed() {
                info!("💓 Heartbeat: signaling link idle, reconnecting socket");
                session.reconnect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::error::ErrorKind;
    use crate::signal::session::{CallId, PeerConnection};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    #[derive(Debug, Default)]
    struct FakeState {
        open: bool,
        disconnected: bool,
        destroyed: bool,
        reconnects: u32,
        destroys: u32,
        closes: u32,
    }

    type Shared = Arc<Mutex<FakeState>>;

    struct FakeSession(Shared);

    impl Session for FakeSession {
        fn is_open(&self) -> bool {
            self.0.lock().unwrap().open
        }
        fn is_disconnected(&self) -> bool {
            self.0.lock().unwrap().disconnected
        }
        fn is_destroyed(&self) -> bool {
            self.0.lock().unwrap().destroyed
        }
        fn reconnect(&mut self) {
            self.0.lock().unwrap().reconnects += 1;
        }
        fn destroy(&mut self) -> Result<(), SessionError> {
            let mut state = self.0.lock().unwrap();
            state.destroyed = true;
            state.open = false;
            state.destroys += 1;
            Ok(())
        }
        fn call(&mut self, target: &Identity, _sdp: String) -> Result<OutgoingCall, SignalError> {
            let (_tx, answer) = oneshot::channel();
            Ok(OutgoingCall {
                call_id: CallId("mc_fake".to_string()),
                target: target.clone(),
                answer,
            })
        }
        fn answer(&mut self, _call: &IncomingCall, _sdp: String) -> Result<(), SignalError> {
            Ok(())
        }
        fn connect(&mut self, _target: &Identity) -> Result<PeerConnectionId, SignalError> {
            Ok(PeerConnectionId("dc_fake".to_string()))
        }
        fn send(&mut self, _c: &PeerConnectionId, _m: PeerMessage) -> Result<(), SignalError> {
            Ok(())
        }
        fn close_connection(&mut self, _c: &PeerConnectionId) -> Result<(), SignalError> {
            self.0.lock().unwrap().closes += 1;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeFactory {
        created: Arc<Mutex<Vec<(SessionId, Identity, Shared)>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl FakeFactory {
        fn count(&self) -> usize {
            self.created.lock().unwrap().len()
        }

        fn session(&self, index: usize) -> (SessionId, Shared) {
            let created = self.created.lock().unwrap();
            (created[index].0, created[index].2.clone())
        }

        fn identity(&self, index: usize) -> Identity {
            self.created.lock().unwrap()[index].1.clone()
        }
    }

    impl SessionFactory for FakeFactory {
        type Session = FakeSession;

        fn create(
            &mut self,
            id: SessionId,
            identity: &Identity,
            _options: &SessionOptions,
        ) -> Result<FakeSession, SignalError> {
            if *self.fail.lock().unwrap() {
                return Err(SignalError::Construction("transport unavailable".to_string()));
            }
            let shared = Shared::default();
            self.created
                .lock()
                .unwrap()
                .push((id, identity.clone(), shared.clone()));
            Ok(FakeSession(shared))
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn id(name: &str) -> Identity {
        Identity::new(name).unwrap()
    }

    fn manager() -> (SignalManager<FakeFactory>, FakeFactory) {
        let factory = FakeFactory::default();
        (
            SignalManager::new(factory.clone(), ManagerSettings::default()),
            factory,
        )
    }

    /// Mark the session open and deliver the open event, as the transport would
    fn open_session(m: &mut SignalManager<FakeFactory>, f: &FakeFactory, index: usize, now: Instant) {
        let (sid, state) = f.session(index);
        {
            let mut state = state.lock().unwrap();
            state.open = true;
            state.disconnected = false;
        }
        m.handle_event(sid, SessionEvent::Open(f.identity(index).to_string()), now);
    }

    fn counter() -> (Arc<Mutex<u32>>, Arc<Mutex<u32>>) {
        let count = Arc::new(Mutex::new(0));
        (count.clone(), count)
    }

    fn incoming_call() -> IncomingCall {
        IncomingCall {
            call_id: CallId("mc_1".to_string()),
            peer: "user_7".to_string(),
            sdp: "v=0".to_string(),
        }
    }

    #[test]
    fn test_rapid_init_builds_one_session() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        let (calls, sink) = counter();
        m.set_on_incoming_call(move |_| *sink.lock().unwrap() += 1);

        m.init(id("user_42"), t0);
        m.init(id("user_42"), t0 + Duration::from_millis(300));
        assert_eq!(f.count(), 1);

        open_session(&mut m, &f, 0, t0 + secs(1));
        // Past the debounce window a live session for the same identity is kept
        m.init(id("user_42"), t0 + secs(6));
        assert_eq!(f.count(), 1);
        assert_eq!(m.sessions_created(), 1);

        let (sid, _) = f.session(0);
        m.handle_event(sid, SessionEvent::Call(incoming_call()), t0 + secs(7));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_init_rebuilds_unusable_session() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        m.init(id("user_42"), t0);
        // Never opened: a later init replaces it
        m.init(id("user_42"), t0 + secs(6));
        assert_eq!(f.count(), 2);
        assert!(f.session(0).1.lock().unwrap().destroyed);
    }

    #[test]
    fn test_identity_switch_tears_down_old_session() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        let (calls, sink) = counter();
        m.set_on_incoming_call(move |_| *sink.lock().unwrap() += 1);

        m.init(id("alice"), t0);
        open_session(&mut m, &f, 0, t0 + secs(1));
        assert!(m.is_ready());

        m.init(id("bob"), t0 + secs(6));
        let (old_sid, old_state) = f.session(0);
        assert_eq!(old_state.lock().unwrap().destroys, 1);
        assert_eq!(f.count(), 2);
        assert_eq!(f.identity(1), id("bob"));
        assert!(!m.is_ready());

        // Late events from the old session are not delivered
        m.handle_event(old_sid, SessionEvent::Call(incoming_call()), t0 + secs(7));
        assert_eq!(*calls.lock().unwrap(), 0);

        open_session(&mut m, &f, 1, t0 + secs(8));
        assert!(m.is_ready());
        assert_eq!(m.identity(), Some(&id("bob")));
    }

    #[test]
    fn test_peer_unavailable_does_not_recover() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        m.set_on_error(move |err| sink.lock().unwrap().push(err.kind));

        m.init(id("user_42"), t0);
        open_session(&mut m, &f, 0, t0);
        let (sid, _) = f.session(0);
        m.handle_event(
            sid,
            SessionEvent::Error(SessionError::peer_unavailable("user_7")),
            t0 + secs(1),
        );

        assert_eq!(m.recovery_state(), RecoveryState::Stable);
        assert_eq!(*seen.lock().unwrap(), vec![ErrorKind::PeerUnavailable]);
        assert!(m.is_ready());
    }

    #[test]
    fn test_recovery_scenario_three_ticks() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        let (errors, sink) = counter();
        m.set_on_error(move |_| *sink.lock().unwrap() += 1);

        m.init(id("user_42"), t0);
        open_session(&mut m, &f, 0, t0);
        assert!(m.is_ready());

        let (sid, state) = f.session(0);
        let t1 = t0 + secs(1);
        {
            let mut s = state.lock().unwrap();
            s.open = false;
            s.disconnected = true;
        }
        m.handle_event(
            sid,
            SessionEvent::Error(SessionError::new(ErrorKind::Network, "lost connection")),
            t1,
        );
        assert_eq!(m.recovery_state(), RecoveryState::Recovering);
        assert_eq!(*errors.lock().unwrap(), 1);

        // A second transport error does not start a second loop
        m.handle_event(
            sid,
            SessionEvent::Error(SessionError::new(ErrorKind::SocketError, "reset")),
            t1 + secs(2),
        );
        assert_eq!(m.poll_timeout(), Some(t1 + secs(10)));

        // Heartbeat at t0+15 falls inside the cycle and leaves reconnects to recovery
        m.handle_timeout(t1 + secs(10));
        assert_eq!(state.lock().unwrap().reconnects, 1);
        m.handle_timeout(t0 + secs(15));
        assert_eq!(state.lock().unwrap().reconnects, 1);
        m.handle_timeout(t1 + secs(20));
        assert_eq!(state.lock().unwrap().reconnects, 2);
        // Repeated wakeups inside one interval fire nothing
        m.handle_timeout(t1 + secs(21));
        m.handle_timeout(t1 + secs(25));
        assert_eq!(state.lock().unwrap().reconnects, 2);

        open_session(&mut m, &f, 0, t1 + secs(29));
        m.handle_timeout(t1 + secs(30));
        assert_eq!(m.recovery_state(), RecoveryState::Stable);
        assert_eq!(m.recovery_attempts(), 2);
        assert_eq!(state.lock().unwrap().reconnects, 2);
    }

    #[test]
    fn test_recovery_rebuilds_missing_session() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        m.init(id("user_42"), t0);
        open_session(&mut m, &f, 0, t0);

        let (sid, _) = f.session(0);
        m.handle_event(
            sid,
            SessionEvent::Error(SessionError::new(ErrorKind::ServerError, "relay down")),
            t0,
        );
        m.handle_event(sid, SessionEvent::Close, t0 + secs(1));
        assert!(!m.is_ready());

        m.handle_timeout(t0 + secs(10));
        assert_eq!(f.count(), 2);
        assert_eq!(f.identity(1), id("user_42"));
        // Rebuilding keeps the recovery loop alive until the new session is ready
        assert_eq!(m.recovery_state(), RecoveryState::Recovering);

        open_session(&mut m, &f, 1, t0 + secs(12));
        m.handle_timeout(t0 + secs(20));
        assert_eq!(m.recovery_state(), RecoveryState::Stable);
    }

    #[test]
    fn test_cleanup_stops_all_timers() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        m.init(id("user_42"), t0);
        open_session(&mut m, &f, 0, t0);
        let (sid, state) = f.session(0);
        m.handle_event(
            sid,
            SessionEvent::Error(SessionError::new(ErrorKind::Network, "offline")),
            t0,
        );

        m.cleanup();
        assert_eq!(m.poll_timeout(), None);
        assert_eq!(m.recovery_state(), RecoveryState::Stable);

        for minutes in 1..=60 {
            m.handle_timeout(t0 + secs(60 * minutes));
        }
        assert_eq!(state.lock().unwrap().reconnects, 0);
        assert_eq!(f.count(), 1);
        assert!(!m.is_ready());
    }

    #[test]
    fn test_connection_set_hygiene() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        m.init(id("user_42"), t0);
        open_session(&mut m, &f, 0, t0);
        let (sid, _) = f.session(0);

        for n in 0..3 {
            let conn_id = PeerConnectionId(format!("dc_{}", n));
            m.handle_event(
                sid,
                SessionEvent::Connection(PeerConnection {
                    id: conn_id.clone(),
                    peer: format!("peer_{}", n),
                }),
                t0,
            );
            m.handle_event(sid, SessionEvent::DataOpen(conn_id), t0);
        }
        assert_eq!(m.tracked_connections(), 3);

        m.handle_event(sid, SessionEvent::DataClose(PeerConnectionId("dc_1".to_string())), t0);
        assert_eq!(m.tracked_connections(), 2);

        m.cleanup();
        assert_eq!(m.tracked_connections(), 0);
    }

    #[test]
    fn test_local_close_purges_connection() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        m.init(id("user_42"), t0);
        open_session(&mut m, &f, 0, t0);
        let (sid, state) = f.session(0);

        let conn_id = PeerConnectionId("dc_0".to_string());
        m.handle_event(
            sid,
            SessionEvent::Connection(PeerConnection {
                id: conn_id.clone(),
                peer: "user_7".to_string(),
            }),
            t0,
        );
        m.handle_event(sid, SessionEvent::DataOpen(conn_id.clone()), t0);
        assert_eq!(m.tracked_connections(), 1);

        m.close_connection(&conn_id).unwrap();
        assert_eq!(state.lock().unwrap().closes, 1);
        assert_eq!(m.tracked_connections(), 0);

        // The transport's own close event afterwards is harmless
        m.handle_event(sid, SessionEvent::DataClose(conn_id), t0);
        assert_eq!(m.tracked_connections(), 0);
    }

    #[test]
    fn test_sync_payload_reaches_callback() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let sink = payloads.clone();
        m.set_sync_callback(move |payload| sink.lock().unwrap().push(payload));

        m.init(id("user_42"), t0);
        open_session(&mut m, &f, 0, t0);
        let (sid, _) = f.session(0);
        let conn_id = PeerConnectionId("dc_0".to_string());
        m.handle_event(
            sid,
            SessionEvent::Connection(PeerConnection {
                id: conn_id.clone(),
                peer: "user_7".to_string(),
            }),
            t0,
        );
        m.handle_event(sid, SessionEvent::DataOpen(conn_id.clone()), t0);
        m.handle_event(
            sid,
            SessionEvent::Data(conn_id, PeerMessage::Sync { payload: json!({"rev": 3}) }),
            t0,
        );

        assert_eq!(*payloads.lock().unwrap(), vec![json!({"rev": 3})]);
    }

    #[test]
    fn test_disconnected_event_reconnects_immediately() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        m.init(id("user_42"), t0);
        open_session(&mut m, &f, 0, t0);
        let (sid, state) = f.session(0);

        m.handle_event(sid, SessionEvent::Disconnected, t0 + secs(1));
        assert_eq!(state.lock().unwrap().reconnects, 1);
        assert_eq!(m.recovery_state(), RecoveryState::Stable);
    }

    #[test]
    fn test_heartbeat_nudges_silent_disconnect() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        m.init(id("user_42"), t0);
        open_session(&mut m, &f, 0, t0);
        let (_, state) = f.session(0);

        m.handle_timeout(t0 + secs(15));
        assert_eq!(state.lock().unwrap().reconnects, 0);

        state.lock().unwrap().disconnected = true;
        assert!(!m.is_ready());
        m.handle_timeout(t0 + secs(30));
        assert_eq!(state.lock().unwrap().reconnects, 1);
    }

    #[test]
    fn test_construction_failure_leaves_not_ready() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        *f.fail.lock().unwrap() = true;

        m.init(id("user_42"), t0);
        assert!(!m.is_ready());
        assert_eq!(m.poll_timeout(), None);
        assert_eq!(f.count(), 0);

        *f.fail.lock().unwrap() = false;
        m.init(id("user_42"), t0 + secs(6));
        assert_eq!(f.count(), 1);
    }

    #[test]
    fn test_outbound_operations_gated_on_ready() {
        let t0 = Instant::now();
        let (mut m, f) = manager();
        let target = id("user_7");

        assert_eq!(
            m.place_call(&target, "v=0".to_string()).unwrap_err(),
            SignalError::NotReady
        );

        m.init(id("user_42"), t0);
        assert_eq!(m.connect(&target).unwrap_err(), SignalError::NotReady);

        open_session(&mut m, &f, 0, t0);
        let call = m.place_call(&target, "v=0".to_string()).unwrap();
        assert_eq!(call.target, target);
        assert_eq!(m.connect(&target).unwrap(), PeerConnectionId("dc_fake".to_string()));
    }
}
