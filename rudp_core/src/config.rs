//! Configuration for the reliable-datagram transport.
//!
//! Loads configuration from JSON strings/files, leaving file IO to the
//! embedding application.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a single connection's reliable channel and keep-alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Initial retransmission timeout for a freshly-sent reliable datagram.
    #[serde(with = "duration_millis")]
    pub resend_timeout_initial: Duration,
    /// Upper bound the doubling retransmission timeout is capped at.
    #[serde(with = "duration_millis")]
    pub resend_timeout_max: Duration,
    /// Number of transmissions (including the first) before a connection is
    /// dropped for exceeding the retry limit.
    pub resend_retry_limit: u32,
    /// Keep-alive interval used before any RTT sample is available, and the
    /// `[min, max]` range it is subsequently clamped to.
    #[serde(with = "duration_millis")]
    pub keep_alive_interval_default: Duration,
    #[serde(with = "duration_millis")]
    pub keep_alive_interval_min: Duration,
    #[serde(with = "duration_millis")]
    pub keep_alive_interval_max: Duration,
    /// Number of recently-seen reliable ids retained for duplicate
    /// suppression.
    pub duplicate_window: usize,
    /// Largest datagram this transport will construct or accept.
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            resend_timeout_initial: Duration::from_millis(100),
            resend_timeout_max: Duration::from_millis(1000),
            resend_retry_limit: 8,
            keep_alive_interval_default: Duration::from_millis(1500),
            keep_alive_interval_min: Duration::from_millis(100),
            keep_alive_interval_max: Duration::from_millis(15000),
            duplicate_window: 1024,
            max_packet_size: 65535,
        }
    }
}

impl TransportConfig {
    /// Parses a configuration from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Checks the semantic invariants serde's shape validation can't catch.
    pub fn validate(&self) -> Result<(), String> {
        if self.resend_retry_limit == 0 {
            return Err("resend_retry_limit must be at least 1".to_string());
        }
        if self.resend_timeout_initial > self.resend_timeout_max {
            return Err("resend_timeout_initial must not exceed resend_timeout_max".to_string());
        }
        if self.keep_alive_interval_min > self.keep_alive_interval_max {
            return Err("keep_alive_interval_min must not exceed keep_alive_interval_max".to_string());
        }
        if self.duplicate_window == 0 {
            return Err("duplicate_window must be at least 1".to_string());
        }
        if self.max_packet_size == 0 {
            return Err("max_packet_size must be at least 1".to_string());
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.resend_timeout_initial, Duration::from_millis(100));
        assert_eq!(cfg.resend_timeout_max, Duration::from_millis(1000));
        assert_eq!(cfg.resend_retry_limit, 8);
        assert_eq!(cfg.keep_alive_interval_default, Duration::from_millis(1500));
        assert_eq!(cfg.duplicate_window, 1024);
        assert_eq!(cfg.max_packet_size, 65535);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn json_round_trip() {
        let cfg = TransportConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back = TransportConfig::from_json_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn rejects_zero_retry_limit() {
        let mut cfg = TransportConfig::default();
        cfg.resend_retry_limit = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_keep_alive_range() {
        let mut cfg = TransportConfig::default();
        cfg.keep_alive_interval_min = Duration::from_millis(9999);
        cfg.keep_alive_interval_max = Duration::from_millis(100);
        assert!(cfg.validate().is_err());
    }
}
