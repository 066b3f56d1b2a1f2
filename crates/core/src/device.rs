//! A single simulated device and its event loop.
//!
//! Each tick the device measures the wall time since the previous tick, advances
//! its schedule entries by that amount and delivers every due event through its
//! sender. Backpressure pauses the device for a fixed delay; any other failure
//! stops this device only and is published on its count stream.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    counts::{count_channel, CountPublisher, CountStream},
    scenario::{Reading, TelemetryEvent},
    schedule::{EntryDefinition, GenerateError, ScheduleEntry},
    tracing::{DiagnosticsSink, SimEvent},
    transport::{EventSender, SendError},
};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

/// Sensor state the generation rules read from.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    id: Arc<str>,
    sequence: u64,
    current_temperature: Option<f32>,
    seed: u64,
}

impl DeviceState {
    pub fn new(id: Arc<str>, seed: u64) -> Self {
        Self {
            id,
            sequence: 0,
            current_temperature: None,
            seed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of events delivered so far; the sequence of the next event.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn current_temperature(&self) -> Option<f32> {
        self.current_temperature
    }

    /// Applies a delivered event.
    pub fn record(&mut self, event: &TelemetryEvent) {
        self.sequence += 1;
        if let Reading::UpdateTemperature { temperature } = event.reading {
            self.current_temperature = Some(temperature);
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceFault {
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error("failed sending event: {0}")]
    Send(#[from] SendError),
    #[error("device loop panicked: {0}")]
    Panicked(String),
}

/// Terminal phase of a device. The backoff pause is observable only through
/// [`SimEvent::Backpressure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhase {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum DeviceExit {
    /// Cancellation was observed between ticks.
    Completed,
    /// Cancellation interrupted a delay, or arrived before the device started.
    Cancelled,
    Failed(DeviceFault),
}

impl DeviceExit {
    pub fn phase(&self) -> DevicePhase {
        match self {
            DeviceExit::Completed => DevicePhase::Completed,
            DeviceExit::Cancelled => DevicePhase::Cancelled,
            DeviceExit::Failed(_) => DevicePhase::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub id: Arc<str>,
    pub sent: u64,
    pub ticks: u64,
    pub exit: DeviceExit,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceOptions {
    /// Pause after the sink signalled backpressure.
    pub backoff: Duration,
    /// Pause between ticks; zero only yields to the scheduler.
    pub tick_interval: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            tick_interval: Duration::ZERO,
        }
    }
}

pub struct Device<S> {
    id: Arc<str>,
    entries: Vec<ScheduleEntry>,
    state: DeviceState,
    sender: Arc<S>,
    counts: CountPublisher,
    diagnostics: Arc<dyn DiagnosticsSink>,
    options: DeviceOptions,
    sent: u64,
    ticks: u64,
}

impl<S: EventSender> Device<S> {
    /// Creates the device together with the stream its counts are published on.
    pub fn new(
        id: Arc<str>,
        definitions: &[EntryDefinition],
        seed: u64,
        sender: Arc<S>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        options: DeviceOptions,
    ) -> (Self, CountStream) {
        let entries = definitions
            .iter()
            .enumerate()
            .map(|(idx, def)| ScheduleEntry::new(def, entry_seed(seed, idx)))
            .collect();
        let (counts, stream) = count_channel(id.clone());
        let device = Self {
            state: DeviceState::new(id.clone(), seed),
            id,
            entries,
            sender,
            counts,
            diagnostics,
            options,
            sent: 0,
            ticks: 0,
        };
        (device, stream)
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    /// Runs the loop until cancellation or a fault, then publishes the terminal signal.
    pub async fn run(mut self, cancel: CancellationToken) -> DeviceReport {
        let result = AssertUnwindSafe(self.tick_loop(&cancel))
            .catch_unwind()
            .await;
        let exit = match result {
            Ok(Ok(exit)) => exit,
            Ok(Err(fault)) => DeviceExit::Failed(fault),
            Err(panic) => DeviceExit::Failed(DeviceFault::Panicked(panic_message(panic))),
        };
        self.finish(exit)
    }

    /// Ends a device whose start was cancelled: nothing is sent, the stream is completed.
    pub fn cancel_before_start(self) -> DeviceReport {
        self.finish(DeviceExit::Cancelled)
    }

    async fn tick_loop(&mut self, cancel: &CancellationToken) -> Result<DeviceExit, DeviceFault> {
        let mut tick_start = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Ok(DeviceExit::Completed);
            }
            let now = Instant::now();
            let delta = now.duration_since(tick_start);
            tick_start = now;
            self.ticks += 1;

            for idx in 0..self.entries.len() {
                let event = {
                    let entry = &mut self.entries[idx];
                    entry.advance(delta);
                    if !entry.is_due() {
                        continue;
                    }
                    entry.generate(&self.state)?
                };

                if self.sender.send(&event).await? {
                    let entry = &mut self.entries[idx];
                    let latency = entry.elapsed();
                    entry.reset();
                    self.state.record(&event);
                    self.sent += 1;
                    self.counts.event_sent();
                    self.diagnostics.record(&SimEvent::EventSent {
                        device: self.id.clone(),
                        event_type: event.event_type(),
                        sequence: event.sequence,
                        latency,
                    });
                } else {
                    self.diagnostics.record(&SimEvent::Backpressure {
                        device: self.id.clone(),
                        event_type: event.event_type(),
                        backoff: self.options.backoff,
                    });
                    if !pause(self.options.backoff, cancel).await {
                        return Ok(DeviceExit::Cancelled);
                    }
                }
            }

            if self.options.tick_interval.is_zero() {
                tokio::task::yield_now().await;
            } else if !pause(self.options.tick_interval, cancel).await {
                // the tick itself was complete
                return Ok(DeviceExit::Completed);
            }
        }
    }

    fn finish(self, exit: DeviceExit) -> DeviceReport {
        match &exit {
            DeviceExit::Failed(fault) => {
                self.diagnostics.record(&SimEvent::DeviceFailed {
                    device: self.id.clone(),
                    fault: fault.clone(),
                });
                self.counts.fail(fault.clone());
            }
            DeviceExit::Completed | DeviceExit::Cancelled => {
                self.diagnostics.record(&SimEvent::DeviceStopped {
                    device: self.id.clone(),
                    sent: self.sent,
                    ticks: self.ticks,
                    cancelled: matches!(exit, DeviceExit::Cancelled),
                });
                self.counts.complete();
            }
        }
        DeviceReport {
            id: self.id,
            sent: self.sent,
            ticks: self.ticks,
            exit,
        }
    }
}

/// Sleeps for `duration` unless cancelled first; returns whether the full delay elapsed.
pub(crate) async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn entry_seed(device_seed: u64, idx: usize) -> u64 {
    device_seed ^ (idx as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
