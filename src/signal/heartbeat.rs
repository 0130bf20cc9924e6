// Heartbeat monitor deadline
// Catches idle socket drops that never produced a disconnected event

use std::time::{Duration, Instant};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    next_beat: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_beat: None,
        }
    }

    /// (Re)start the monitor; any previous schedule is replaced
    pub fn start(&mut self, now: Instant) {
        self.next_beat = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.next_beat = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_beat.is_some()
    }

    pub fn next_beat(&self) -> Option<Instant> {
        self.next_beat
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.next_beat, Some(deadline) if now >= deadline)
    }

    pub fn advance(&mut self, now: Instant) {
        if self.next_beat.is_some() {
            self.next_beat = Some(now + self.interval);
        }
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_schedule() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::default();
        assert!(!monitor.is_due(start + Duration::from_secs(60)));

        monitor.start(start);
        assert!(!monitor.is_due(start + Duration::from_secs(14)));
        assert!(monitor.is_due(start + DEFAULT_HEARTBEAT_INTERVAL));

        monitor.advance(start + DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(monitor.next_beat(), Some(start + Duration::from_secs(30)));

        monitor.stop();
        assert!(!monitor.is_running());
        monitor.advance(start + Duration::from_secs(30));
        assert!(!monitor.is_running());
    }
}
