//! Recurring event generators owned by a simulated device.
//!
//! A [`ScheduleEntry`] accumulates the wall time reported by its device on every
//! tick and becomes due once that time reaches its interval. The device then asks
//! the entry to [`generate`](ScheduleEntry::generate) a payload from the current
//! [`DeviceState`] and, only after the payload was delivered, calls
//! [`reset`](ScheduleEntry::reset).

use std::{fmt, sync::Arc, time::Duration};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{device::DeviceState, scenario::TelemetryEvent};

/// Jitter is clamped below this bound so an effective interval never collapses to zero.
const MAX_JITTER: f64 = 0.95;

/// Builds an event from the state of the device that owns the entry.
///
/// Rules must be pure: the same state always yields the same event.
pub type GenerationRule =
    Arc<dyn Fn(&DeviceState) -> Result<TelemetryEvent, GenerateError> + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed generating `{event}` event: {reason}")]
pub struct GenerateError {
    pub event: &'static str,
    pub reason: String,
}

impl GenerateError {
    pub fn new(event: &'static str, reason: impl Into<String>) -> Self {
        Self {
            event,
            reason: reason.into(),
        }
    }
}

/// Immutable description of a recurring event, shared by every device running a scenario.
#[derive(Clone)]
pub struct EntryDefinition {
    interval: Duration,
    jitter: f64,
    rule: GenerationRule,
}

impl EntryDefinition {
    pub fn new<F>(interval: Duration, rule: F) -> Self
    where
        F: Fn(&DeviceState) -> Result<TelemetryEvent, GenerateError> + Send + Sync + 'static,
    {
        Self {
            interval,
            jitter: 0.0,
            rule: Arc::new(rule),
        }
    }

    pub(crate) fn from_rule(interval: Duration, rule: GenerationRule) -> Self {
        Self {
            interval,
            jitter: 0.0,
            rule,
        }
    }

    /// Spread each effective interval uniformly over `interval * (1 ± jitter)`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, MAX_JITTER)
        } else {
            0.0
        };
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

impl fmt::Debug for EntryDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryDefinition")
            .field("interval", &self.interval)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

/// Timing state for one recurring event of one device.
pub struct ScheduleEntry {
    base_interval: Duration,
    /// Interval in effect until the next reset; differs from `base_interval` only with jitter.
    interval: Duration,
    elapsed: Duration,
    jitter: f64,
    rng: SmallRng,
    rule: GenerationRule,
}

impl ScheduleEntry {
    pub fn new(definition: &EntryDefinition, seed: u64) -> Self {
        let mut entry = Self {
            base_interval: definition.interval,
            interval: definition.interval,
            elapsed: Duration::ZERO,
            jitter: definition.jitter,
            rng: SmallRng::seed_from_u64(seed),
            rule: definition.rule.clone(),
        };
        entry.interval = entry.next_interval();
        entry
    }

    #[inline]
    pub fn advance(&mut self, delta: Duration) {
        self.elapsed = self.elapsed.saturating_add(delta);
    }

    #[inline]
    pub fn is_due(&self) -> bool {
        self.elapsed >= self.interval
    }

    /// Must only be called right after the generated event was delivered.
    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
        self.interval = self.next_interval();
    }

    pub fn generate(&self, state: &DeviceState) -> Result<TelemetryEvent, GenerateError> {
        (self.rule)(state)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn next_interval(&mut self) -> Duration {
        if self.jitter <= 0.0 || self.base_interval.is_zero() {
            return self.base_interval;
        }
        let factor = self
            .rng
            .gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        self.base_interval.mul_f64(factor)
    }
}

impl fmt::Debug for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleEntry")
            .field("interval", &self.interval)
            .field("elapsed", &self.elapsed)
            .finish_non_exhaustive()
    }
}
