//! Idle-peer keep-alive scheduling.
//!
//! Tracks when a connection last sent anything and decides when the next
//! Ping is due. The actual interval is computed by `RttEstimator`'s
//! `keep_alive_interval`; this module only tracks the clock.

use std::time::{Duration, Instant};

pub struct KeepAlive {
    last_send_at: Instant,
}

impl KeepAlive {
    pub fn new(now: Instant) -> Self {
        Self { last_send_at: now }
    }

    /// Call whenever any datagram is sent on this connection, reliable or
    /// not — keep-alives only fire during genuine idleness.
    pub fn record_send(&mut self, now: Instant) {
        self.last_send_at = now;
    }

    pub fn is_due(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_send_at) >= interval
    }

    pub fn next_deadline(&self, interval: Duration) -> Instant {
        self.last_send_at + interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_due_before_interval_elapses() {
        let now = Instant::now();
        let ka = KeepAlive::new(now);
        assert!(!ka.is_due(now + Duration::from_millis(1000), Duration::from_millis(1500)));
    }

    #[test]
    fn due_once_interval_elapses() {
        let now = Instant::now();
        let ka = KeepAlive::new(now);
        assert!(ka.is_due(now + Duration::from_millis(1500), Duration::from_millis(1500)));
    }

    #[test]
    fn record_send_resets_the_idle_clock() {
        let now = Instant::now();
        let mut ka = KeepAlive::new(now);
        let later = now + Duration::from_millis(1000);
        ka.record_send(later);
        assert!(!ka.is_due(later + Duration::from_millis(1000), Duration::from_millis(1500)));
        assert!(ka.is_due(later + Duration::from_millis(1500), Duration::from_millis(1500)));
    }
}
