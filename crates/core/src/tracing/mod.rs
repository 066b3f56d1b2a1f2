//! Diagnostics emitted while a simulation runs, and the process-wide tracing setup.
//!
//! Every component reports through a [`DiagnosticsSink`]. Recording is fire and
//! forget: sinks never block the caller and never fail back into the simulation.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::{aggregator::DeviceStatus, device::DeviceFault, fleet::FleetPhase};

mod latency_log;

pub use latency_log::{LatencyLog, LatencyLogError};

#[derive(Debug, Clone)]
pub enum SimEvent {
    SimulationStarted {
        scenario: String,
        instance: String,
        devices: usize,
        sender_pool: usize,
        warmup: Duration,
    },
    DeviceStarted {
        device: Arc<str>,
        offset: Duration,
    },
    EventSent {
        device: Arc<str>,
        event_type: &'static str,
        sequence: u64,
        /// Time the firing entry had accumulated since its previous delivery.
        latency: Duration,
    },
    Backpressure {
        device: Arc<str>,
        event_type: &'static str,
        backoff: Duration,
    },
    DeviceFailed {
        device: Arc<str>,
        fault: DeviceFault,
    },
    DeviceStopped {
        device: Arc<str>,
        sent: u64,
        ticks: u64,
        cancelled: bool,
    },
    WindowTotal {
        window: u64,
        running_total: u64,
    },
    DeviceTotal {
        device: Arc<str>,
        sent: u64,
        status: DeviceStatus,
    },
    FinalTotal {
        total: u64,
    },
    SenderCloseFailed {
        slot: usize,
        reason: String,
    },
    SimulationEnded {
        phase: FleetPhase,
        total: u64,
        elapsed: Duration,
    },
}

pub trait DiagnosticsSink: Send + Sync + 'static {
    fn record(&self, event: &SimEvent);
}

/// Turns every diagnostic into a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn record(&self, event: &SimEvent) {
        match event {
            SimEvent::SimulationStarted {
                scenario,
                instance,
                devices,
                sender_pool,
                warmup,
            } => tracing::info!(
                %scenario,
                %instance,
                devices,
                sender_pool,
                warmup_ms = warmup.as_millis() as u64,
                "simulation started"
            ),
            SimEvent::DeviceStarted { device, offset } => {
                tracing::debug!(%device, offset_ms = offset.as_millis() as u64, "device started")
            }
            SimEvent::EventSent {
                device,
                event_type,
                sequence,
                latency,
            } => tracing::trace!(
                %device,
                event_type,
                sequence,
                latency_ms = latency.as_millis() as u64,
                "event sent"
            ),
            SimEvent::Backpressure {
                device,
                event_type,
                backoff,
            } => tracing::debug!(
                %device,
                event_type,
                backoff_ms = backoff.as_millis() as u64,
                "sink applied backpressure"
            ),
            SimEvent::DeviceFailed { device, fault } => {
                tracing::error!(%device, %fault, "device failed")
            }
            SimEvent::DeviceStopped {
                device,
                sent,
                ticks,
                cancelled,
            } => tracing::debug!(%device, sent, ticks, cancelled, "device stopped"),
            SimEvent::WindowTotal {
                window,
                running_total,
            } => tracing::info!(window, running_total, "events sent in window"),
            SimEvent::DeviceTotal {
                device,
                sent,
                status,
            } => tracing::info!(%device, sent, ?status, "device total"),
            SimEvent::FinalTotal { total } => tracing::info!(total, "total events sent"),
            SimEvent::SenderCloseFailed { slot, reason } => {
                tracing::warn!(slot, %reason, "failed closing sender")
            }
            SimEvent::SimulationEnded {
                phase,
                total,
                elapsed,
            } => tracing::info!(
                ?phase,
                total,
                elapsed_ms = elapsed.as_millis() as u64,
                "simulation ended"
            ),
        }
    }
}

/// Forwards each diagnostic to all the wrapped sinks, in order.
#[derive(Clone, Default)]
pub struct CombinedDiagnostics(Vec<Arc<dyn DiagnosticsSink>>);

impl CombinedDiagnostics {
    pub fn new(sinks: Vec<Arc<dyn DiagnosticsSink>>) -> Self {
        Self(sinks)
    }

    pub fn push(&mut self, sink: Arc<dyn DiagnosticsSink>) {
        self.0.push(sink);
    }
}

impl DiagnosticsSink for CombinedDiagnostics {
    fn record(&self, event: &SimEvent) {
        for sink in &self.0 {
            sink.record(event);
        }
    }
}

/// Keeps every diagnostic in memory, for inspection after a run.
#[derive(Default)]
pub struct MemoryDiagnostics {
    events: Mutex<Vec<SimEvent>>,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, filter: impl Fn(&SimEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| filter(e)).count()
    }
}

impl DiagnosticsSink for MemoryDiagnostics {
    fn record(&self, event: &SimEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(feature = "trace")]
pub mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    pub fn init_tracer(
        level: Option<LevelFilter>,
    ) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy();

        if std::env::var("DEVSIM_DISABLE_LOGS").is_ok() {
            return Ok(());
        }
        let to_stderr = std::env::var("DEVSIM_LOG_TO_STDERR").is_ok();
        let use_json = std::env::var("DEVSIM_LOG_FORMAT")
            .map(|v| v.to_lowercase() == "json")
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_forwards_to_every_sink() {
        let first = Arc::new(MemoryDiagnostics::new());
        let second = Arc::new(MemoryDiagnostics::new());
        let mut combined = CombinedDiagnostics::new(vec![first.clone()]);
        combined.push(second.clone());
        combined.push(Arc::new(TracingDiagnostics));

        combined.record(&SimEvent::FinalTotal { total: 3 });
        combined.record(&SimEvent::WindowTotal {
            window: 1,
            running_total: 3,
        });

        for sink in [first, second] {
            let events = sink.events();
            assert_eq!(events.len(), 2);
            assert!(matches!(events[0], SimEvent::FinalTotal { total: 3 }));
        }
    }

    #[test]
    fn memory_sink_counts_matching_events() {
        let sink = MemoryDiagnostics::new();
        for total in 0..4 {
            sink.record(&SimEvent::FinalTotal { total });
        }
        sink.record(&SimEvent::SenderCloseFailed {
            slot: 0,
            reason: "gone".into(),
        });
        assert_eq!(
            sink.count(|e| matches!(e, SimEvent::FinalTotal { .. })),
            4
        );
    }
}
