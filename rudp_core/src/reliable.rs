//! The reliable channel: message-id assignment, the outstanding-send table,
//! retransmission, RTT estimation, and inbound duplicate suppression.
//!
//! One `ReliableChannel` lives inside each connection's task and is only
//! ever touched from there.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Effect run exactly once when a reliable send is acknowledged.
pub type AckCallback = Box<dyn FnOnce() + Send + Sync>;

/// Bookkeeping for one unacknowledged reliable datagram.
pub struct ResendEntry {
    pub id: u16,
    buffer: Vec<u8>,
    send_count: u32,
    first_sent_at: Instant,
    last_sent_at: Instant,
    timeout: Duration,
    ack_callback: Option<AckCallback>,
}

impl ResendEntry {
    fn deadline(&self) -> Instant {
        self.last_sent_at + self.timeout
    }
}

/// What to do after a resend timer fires.
pub enum RetransmitOutcome {
    /// Resend this buffer and rearm the timer.
    Resend(Vec<u8>),
    /// `send_count` exceeded the retry limit; the entry has been removed.
    RetryLimitExceeded,
}

/// Exponentially-weighted RTT and RTT-variance estimator (Karn's algorithm:
/// only genuinely-first-try sends contribute a sample).
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    estimate_ms: f64,
    variance_ms: f64,
    sampled: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            estimate_ms: 0.0,
            variance_ms: 0.0,
            sampled: false,
        }
    }

    pub fn sample(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        if !self.sampled {
            self.estimate_ms = sample_ms;
            self.variance_ms = sample_ms / 2.0;
            self.sampled = true;
            return;
        }
        self.estimate_ms = 0.875 * self.estimate_ms + 0.125 * sample_ms;
        self.variance_ms = 0.75 * self.variance_ms + 0.25 * (sample_ms - self.estimate_ms).abs();
    }

    pub fn estimate(&self) -> Duration {
        Duration::from_secs_f64((self.estimate_ms.max(0.0)) / 1000.0)
    }

    /// `max(min_resend, rttEstimate + 4*rttVariance)`.
    pub fn resend_timeout(&self, min_resend: Duration) -> Duration {
        let computed_ms = (self.estimate_ms + 4.0 * self.variance_ms).max(0.0);
        Duration::from_secs_f64(computed_ms / 1000.0).max(min_resend)
    }

    /// `clamp(rttEstimate*3, min, max)`, or `default` before any sample.
    pub fn keep_alive_interval(&self, default: Duration, min: Duration, max: Duration) -> Duration {
        if !self.sampled {
            return default;
        }
        let interval = Duration::from_secs_f64((self.estimate_ms * 3.0) / 1000.0);
        interval.clamp(min, max)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn forward_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// Bounded set of recently-seen inbound reliable ids, aged out as ids fall
/// more than `window` positions behind the newest observed id on the
/// 16-bit wraparound circle.
pub struct DuplicateFilter {
    seen: HashSet<u16>,
    newest: Option<u16>,
    window: u16,
}

impl DuplicateFilter {
    pub fn new(window: usize) -> Self {
        Self {
            seen: HashSet::new(),
            newest: None,
            window: window.min(0x7fff) as u16,
        }
    }

    /// Records `id` as seen and returns `true` if it had already been seen
    /// (and should be dropped without delivery).
    pub fn check_and_insert(&mut self, id: u16) -> bool {
        if self.seen.contains(&id) {
            return true;
        }
        self.seen.insert(id);
        match self.newest {
            None => self.newest = Some(id),
            Some(cur) if forward_distance(cur, id) < 0x8000 => self.newest = Some(id),
            Some(_) => {}
        }
        self.age_out();
        false
    }

    fn age_out(&mut self) {
        let Some(newest) = self.newest else { return };
        let window = self.window;
        self.seen
            .retain(|&id| newest.wrapping_sub(id) <= window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Per-connection reliable-send/receive state.
pub struct ReliableChannel {
    last_message_id: u16,
    send_table: HashMap<u16, ResendEntry>,
    pub rtt: RttEstimator,
    duplicates: DuplicateFilter,
}

impl ReliableChannel {
    pub fn new(duplicate_window: usize) -> Self {
        Self {
            last_message_id: 0,
            send_table: HashMap::new(),
            rtt: RttEstimator::new(),
            duplicates: DuplicateFilter::new(duplicate_window),
        }
    }

    /// Assigns the next outbound reliable id, wrapping mod 2^16.
    pub fn next_id(&mut self) -> u16 {
        self.last_message_id = self.last_message_id.wrapping_add(1);
        self.last_message_id
    }

    /// Registers a freshly-sent reliable datagram and returns the initial
    /// resend timeout to arm a timer with.
    pub fn track_send(
        &mut self,
        id: u16,
        buffer: Vec<u8>,
        now: Instant,
        min_resend: Duration,
        ack_callback: Option<AckCallback>,
    ) -> Duration {
        let timeout = self.rtt.resend_timeout(min_resend);
        self.send_table.insert(
            id,
            ResendEntry {
                id,
                buffer,
                send_count: 1,
                first_sent_at: now,
                last_sent_at: now,
                timeout,
                ack_callback,
            },
        );
        timeout
    }

    /// Removes the entry for `id`, samples RTT (only when it was never
    /// retransmitted), and invokes its ack callback.
    pub fn on_ack(&mut self, id: u16, now: Instant) -> bool {
        let Some(entry) = self.send_table.remove(&id) else {
            return false;
        };
        if entry.send_count == 1 {
            self.rtt.sample(now.saturating_duration_since(entry.first_sent_at));
        }
        if let Some(cb) = entry.ack_callback {
            cb();
        }
        true
    }

    /// Ids of entries whose resend deadline has passed, in ascending
    /// wrap-aware order rooted at the oldest unacknowledged id (ties
    /// broken by insertion id).
    pub fn due_entries(&self, now: Instant) -> Vec<u16> {
        let mut due: Vec<u16> = self
            .send_table
            .values()
            .filter(|e| e.deadline() <= now)
            .map(|e| e.id)
            .collect();
        if due.is_empty() {
            return due;
        }
        let root = due.iter().copied().min_by_key(|&id| {
            self.send_table[&id].first_sent_at
        }).unwrap();
        due.sort_by_key(|&id| forward_distance(root, id));
        due
    }

    /// The earliest deadline across all outstanding entries, for arming the
    /// connection's single timer.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.send_table.values().map(|e| e.deadline()).min()
    }

    /// Retransmits the entry for `id`: bumps `send_count`, doubles the
    /// timeout up to `max_resend`, and returns the buffer to resend, or
    /// removes the entry and reports the retry limit if exceeded.
    pub fn retransmit(
        &mut self,
        id: u16,
        now: Instant,
        max_resend: Duration,
        retry_limit: u32,
    ) -> Option<RetransmitOutcome> {
        let entry = self.send_table.get_mut(&id)?;
        entry.send_count += 1;
        if entry.send_count > retry_limit {
            self.send_table.remove(&id);
            return Some(RetransmitOutcome::RetryLimitExceeded);
        }
        entry.last_sent_at = now;
        entry.timeout = (entry.timeout * 2).min(max_resend);
        Some(RetransmitOutcome::Resend(entry.buffer.clone()))
    }

    pub fn outstanding_count(&self) -> usize {
        self.send_table.len()
    }

    /// Runs inbound duplicate suppression for a received reliable id.
    /// Returns `true` if this is a duplicate that must be acked but not
    /// delivered.
    pub fn is_duplicate(&mut self, id: u16) -> bool {
        self.duplicates.check_and_insert(id)
    }

    pub fn duplicate_window_len(&self) -> usize {
        self.duplicates.len()
    }
}
