// Reconnection policy for the signaling session
// Transport failures enter Recovering; a fixed-interval tick runs until the session is ready again

use std::time::{Duration, Instant};

/// Default spacing between recovery ticks
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Stable,
    Recovering,
}

/// Recovery loop state. At most one loop is active at a time.
///
/// Retries are unbounded and evenly spaced: the signaling layer is best-effort
/// and the consumer has nothing better to do while it is down.
#[derive(Debug)]
pub struct RecoveryPolicy {
    state: RecoveryState,
    interval: Duration,
    next_tick: Option<Instant>,
    attempts: u32,
}

impl RecoveryPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: RecoveryState::Stable,
            interval,
            next_tick: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn is_recovering(&self) -> bool {
        self.state == RecoveryState::Recovering
    }

    /// Enter Recovering and arm the first tick. Returns false if a loop is already running.
    pub fn begin(&mut self, now: Instant) -> bool {
        if self.is_recovering() {
            return false;
        }
        self.state = RecoveryState::Recovering;
        self.attempts = 0;
        self.next_tick = Some(now + self.interval);
        true
    }

    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.next_tick, Some(deadline) if now >= deadline)
    }

    /// Consume a due tick and schedule the next one a full interval from `now`,
    /// so a late wakeup never produces a burst of catch-up attempts.
    pub fn advance(&mut self, now: Instant) {
        if self.is_recovering() {
            self.next_tick = Some(now + self.interval);
        }
    }

    /// Count a reconnect attempt made on this tick
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Attempts made during the current (or last) recovery cycle
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Session is ready again: back to Stable
    pub fn settle(&mut self) {
        self.state = RecoveryState::Stable;
        self.next_tick = None;
    }

    /// Stop the loop without a successful recovery (consumer cleanup)
    pub fn cancel(&mut self) {
        self.settle();
        self.attempts = 0;
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECOVERY_INTERVAL)
    }
}
