//! Periodic wake driving the loss detection alarm.
//!
//! A single 25 ms tick polls the armed deadline; sub-tick alarms are
//! coalesced up to the next tick. This deliberately bounds handler
//! frequency at the cost of up to one tick of timer latency.

use crate::detector::LossDetector;
use crate::types::{Clock, Instant};
use core::time::Duration;
use std::sync::Weak;
use tokio::task::JoinHandle;

/// Granularity of the periodic wake.
pub const LOSS_DETECTION_TICK: Duration = Duration::from_millis(25);

/// Spawn the periodic wake onto the ambient tokio runtime.
///
/// Returns `None` outside a runtime; the embedding then drives
/// [`LossDetector::handle_tick`] from its own scheduler.
pub(crate) fn spawn_periodic_wake(detector: Weak<LossDetector>) -> Option<JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    Some(handle.spawn(periodic_wake(detector)))
}

async fn periodic_wake(detector: Weak<LossDetector>) {
    let start = tokio::time::Instant::now() + LOSS_DETECTION_TICK;
    let mut interval = tokio::time::interval_at(start, LOSS_DETECTION_TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(detector) = detector.upgrade() else {
            break;
        };
        if !detector.handle_tick() {
            break;
        }
    }
}

/// [`Clock`] backed by the tokio runtime's notion of time, which tests can
/// pause and advance.
#[derive(Debug, Clone)]
pub struct TokioClock {
    epoch: tokio::time::Instant,
}

impl TokioClock {
    /// Anchor the epoch at the current instant.
    pub fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        let elapsed = self.epoch.elapsed();
        Instant::from_nanos(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
    }
}
