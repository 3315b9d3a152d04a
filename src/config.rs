//! Loss detection configuration.
//!
//! Thresholds and base durations for the recovery algorithms
//! (RFC 9002 Appendix A). Immutable after the detector is constructed.

use core::time::Duration;
use serde::{Deserialize, Serialize};

/// Time-threshold multiplier expressed as an integer rational so that
/// loss-delay arithmetic stays in exact integer nanoseconds.
///
/// The RECOMMENDED value is 9/8 (RFC 9002 Section 6.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeThreshold {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeThreshold {
    /// Scale a duration by this threshold.
    pub fn apply(&self, duration: Duration) -> Duration {
        duration * self.numerator / self.denominator
    }
}

impl Default for TimeThreshold {
    fn default() -> Self {
        Self {
            numerator: 9,
            denominator: 8,
        }
    }
}

/// Loss Detection Configuration (RFC 9002 Appendix A)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossDetectionConfig {
    /// Packet reordering threshold (kPacketThreshold, default 3).
    ///
    /// A packet is declared lost when a packet at least this many packet
    /// numbers greater has been acknowledged.
    pub packet_threshold: u64,

    /// Time reordering threshold (kTimeThreshold, default 9/8).
    pub time_threshold: TimeThreshold,

    /// Timer granularity (kGranularity, default 1ms).
    ///
    /// A floor for every timer duration the estimator derives.
    pub granularity: Duration,

    /// Initial RTT estimate used before any sample exists
    /// (kInitialRtt, default 333ms).
    pub initial_rtt: Duration,

    /// Maximum ACK delay the peer may add before acknowledging
    /// (default 25ms).
    pub max_ack_delay: Duration,
}

impl Default for LossDetectionConfig {
    fn default() -> Self {
        Self {
            packet_threshold: 3,
            time_threshold: TimeThreshold::default(),
            granularity: Duration::from_millis(1),
            initial_rtt: Duration::from_millis(333),
            max_ack_delay: Duration::from_millis(25),
        }
    }
}

impl LossDetectionConfig {
    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.packet_threshold == 0 {
            errors.push("packet_threshold must be at least 1".to_string());
        }
        if self.time_threshold.denominator == 0 {
            errors.push("time_threshold denominator must be nonzero".to_string());
        } else if self.time_threshold.numerator <= self.time_threshold.denominator {
            errors.push("time_threshold must be greater than 1".to_string());
        }
        if self.granularity.is_zero() {
            errors.push("granularity must be nonzero".to_string());
        }
        if self.initial_rtt.is_zero() {
            errors.push("initial_rtt must be nonzero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
