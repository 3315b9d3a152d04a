//! # RTT Estimation (RFC 9002 Section 5)
//!
//! Maintains latest/smoothed/minimum RTT and variance, and derives every
//! timeout the loss detector arms: the probe timeout, the handshake
//! retransmission timeout, and the persistent-congestion period. Also holds
//! the PTO and crypto back-off counters, which the loss detector bumps on
//! timer expiry and clears when an ACK acknowledges new data.

#![forbid(unsafe_code)]

use crate::config::LossDetectionConfig;
use core::time::Duration;

/// Copyable snapshot of the estimator, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttStats {
    pub latest_rtt: Duration,
    pub smoothed_rtt: Duration,
    pub rttvar: Duration,
    pub min_rtt: Duration,
    pub pto_count: u32,
    pub crypto_count: u32,
}

/// RTT Estimator (RFC 9002 Section 5, update rules per RFC 6298).
///
/// All arithmetic is exact integer nanoseconds; the fractional EWMA weights
/// are computed as `(7x + y) / 8` style expressions, which fit 64-bit
/// intermediates for any representable RTT.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Latest RTT sample.
    latest_rtt: Duration,

    /// Smoothed RTT (SRTT). Zero until the first sample arrives.
    smoothed_rtt: Duration,

    /// RTT variance (RTTVAR).
    rttvar: Duration,

    /// Minimum RTT observed. Ignores ack delay.
    min_rtt: Duration,

    /// Upper bound applied to peer-reported ack delay.
    max_ack_delay: Duration,

    /// Consecutive PTO expiries since the last ACK of new data.
    pto_count: u32,

    /// Consecutive crypto retransmission expiries since the last ACK of
    /// new data.
    crypto_count: u32,

    /// Timer precision floor (kGranularity).
    granularity: Duration,

    /// RTT assumed before any sample exists (kInitialRtt).
    initial_rtt: Duration,
}

impl RttEstimator {
    pub fn new(config: &LossDetectionConfig) -> Self {
        Self {
            latest_rtt: Duration::ZERO,
            smoothed_rtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            min_rtt: Duration::ZERO,
            max_ack_delay: config.max_ack_delay,
            pto_count: 0,
            crypto_count: 0,
            granularity: config.granularity,
            initial_rtt: config.initial_rtt,
        }
    }

    /// Incorporate a fresh RTT sample (RFC 9002 Section 5.3).
    ///
    /// `ack_delay` is the peer-reported delay, already scaled by the peer's
    /// ack_delay_exponent.
    pub fn update_rtt(&mut self, latest_rtt: Duration, ack_delay: Duration) {
        self.latest_rtt = latest_rtt;

        if self.smoothed_rtt.is_zero() {
            // First sample.
            self.min_rtt = Duration::ZERO;
            self.smoothed_rtt = latest_rtt;
            self.rttvar = latest_rtt / 2;
            return;
        }

        // min_rtt ignores ack delay.
        self.min_rtt = self.min_rtt.min(latest_rtt);
        // Limit ack_delay by max_ack_delay.
        let ack_delay = ack_delay.min(self.max_ack_delay);
        // Adjust for ack delay only when plausible.
        let mut adjusted_rtt = self.latest_rtt;
        if adjusted_rtt > self.min_rtt + ack_delay {
            adjusted_rtt -= ack_delay;
        }

        let deviation = if self.smoothed_rtt > adjusted_rtt {
            self.smoothed_rtt - adjusted_rtt
        } else {
            adjusted_rtt - self.smoothed_rtt
        };
        self.rttvar = (self.rttvar * 3 + deviation) / 4;
        self.smoothed_rtt = (self.smoothed_rtt * 7 + adjusted_rtt) / 8;
    }

    /// Probe timeout for the current back-off level (RFC 9002 Section 6.2):
    /// `max(srtt + 4*rttvar + max_ack_delay, kGranularity) * 2^pto_count`.
    pub fn current_pto_period(&self) -> Duration {
        let duration = self.smoothed_rtt + self.rttvar * 4 + self.max_ack_delay;
        duration
            .max(self.granularity)
            .saturating_mul(backoff(self.pto_count))
    }

    /// Crypto retransmission timeout for the current back-off level.
    ///
    /// Twice the smoothed RTT, or twice the initial RTT before any sample.
    pub fn handshake_retransmit_timeout(&self) -> Duration {
        let base = if self.smoothed_rtt.is_zero() {
            self.initial_rtt * 2
        } else {
            self.smoothed_rtt * 2
        };
        base.max(self.granularity)
            .saturating_mul(backoff(self.crypto_count))
    }

    /// Period used by persistent congestion detection:
    /// `(srtt + max(4*rttvar, kGranularity)) * threshold`.
    pub fn congestion_period(&self, threshold: u32) -> Duration {
        let pto = self.smoothed_rtt + (self.rttvar * 4).max(self.granularity);
        pto.saturating_mul(threshold)
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    pub fn crypto_count(&self) -> u32 {
        self.crypto_count
    }

    pub fn set_pto_count(&mut self, count: u32) {
        self.pto_count = count;
    }

    pub fn set_crypto_count(&mut self, count: u32) {
        self.crypto_count = count;
    }

    pub fn stats(&self) -> RttStats {
        RttStats {
            latest_rtt: self.latest_rtt,
            smoothed_rtt: self.smoothed_rtt,
            rttvar: self.rttvar,
            min_rtt: self.min_rtt,
            pto_count: self.pto_count,
            crypto_count: self.crypto_count,
        }
    }

    /// Return all measurement state and counters to their initial values.
    pub fn reset(&mut self) {
        self.latest_rtt = Duration::ZERO;
        self.smoothed_rtt = Duration::ZERO;
        self.rttvar = Duration::ZERO;
        self.min_rtt = Duration::ZERO;
        self.pto_count = 0;
        self.crypto_count = 0;
    }
}

/// Exponential back-off multiplier, saturating rather than wrapping on
/// pathological counts.
fn backoff(count: u32) -> u32 {
    2u32.saturating_pow(count)
}
