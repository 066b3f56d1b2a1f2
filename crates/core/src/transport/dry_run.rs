use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use super::{EventSender, SendError, SenderFactory};
use crate::scenario::TelemetryEvent;

/// Sender that never leaves the process.
///
/// Events are logged at `TRACE` level. A configurable share of sends is answered
/// with backpressure so throttling behaviour can be exercised without a sink.
pub struct DryRunSender {
    slot: usize,
    throttle_ratio: f64,
    rng: Mutex<SmallRng>,
    delivered: AtomicU64,
    throttled: AtomicU64,
    closed: AtomicBool,
}

impl DryRunSender {
    pub fn new(slot: usize, throttle_ratio: f64, seed: u64) -> Self {
        Self {
            slot,
            throttle_ratio: throttle_ratio.clamp(0.0, 1.0),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            delivered: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    fn should_throttle(&self) -> bool {
        self.throttle_ratio > 0.0 && self.rng.lock().gen_bool(self.throttle_ratio)
    }
}

impl EventSender for DryRunSender {
    async fn send(&self, event: &TelemetryEvent) -> Result<bool, SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        if self.should_throttle() {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        let payload =
            serde_json::to_string(event).map_err(|e| SendError::Encoding(e.to_string()))?;
        tracing::trace!(slot = self.slot, %payload, "dry-run delivery");
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn close(&self) -> Result<(), SendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SendError::Closed);
        }
        tracing::debug!(
            slot = self.slot,
            delivered = self.delivered(),
            throttled = self.throttled(),
            "closed dry-run sender"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DryRunFactory {
    throttle_ratio: f64,
    seed: u64,
}

impl DryRunFactory {
    pub fn new(throttle_ratio: f64, seed: u64) -> Self {
        Self {
            throttle_ratio,
            seed,
        }
    }
}

impl SenderFactory for DryRunFactory {
    type Sender = DryRunSender;

    fn create(&self, slot: usize) -> Result<DryRunSender, SendError> {
        Ok(DryRunSender::new(
            slot,
            self.throttle_ratio,
            self.seed.wrapping_add(slot as u64),
        ))
    }
}
