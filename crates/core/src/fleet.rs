//! Runs a whole fleet of devices for one scenario.
//!
//! Devices of an instance start staggered across the warmup window, share a
//! fixed pool of senders round-robin and publish their counts to a single
//! aggregator. A run ends once every device is terminal; the sender pool is
//! released afterwards no matter how the devices ended.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregator::{Aggregator, FleetTotals},
    config::{ConfigError, SimulatorConfig},
    counts::CountObserver,
    device::{pause, Device, DeviceExit, DeviceFault, DeviceOptions, DeviceReport},
    scenario::ScenarioProvider,
    tracing::{DiagnosticsSink, SimEvent, TracingDiagnostics},
    transport::{EventSender, SendError, SenderFactory},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetPhase {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Setup failures; once devices run, the fleet always returns a report.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown scenario `{0}`")]
    UnknownScenario(String),
    #[error("scenario `{0}` has no entries")]
    EmptyScenario(String),
    #[error("failed creating sender for pool slot {slot}: {source}")]
    SenderPool { slot: usize, source: SendError },
}

#[derive(Debug, Clone)]
pub struct FleetReport {
    pub phase: FleetPhase,
    pub elapsed: Duration,
    pub totals: FleetTotals,
    pub devices: Vec<DeviceReport>,
    pub sender_close_failures: usize,
}

impl FleetReport {
    pub fn failed_devices(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| matches!(d.exit, DeviceExit::Failed(_)))
            .count()
    }

    pub fn events_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.totals.grand_total as f64 / secs
        } else {
            0.0
        }
    }

    pub fn print(&self) {
        println!("\n=== Simulation Report ===");
        println!("Phase: {:?}", self.phase);
        println!("Duration: {:?}", self.elapsed);
        println!("Devices: {}", self.devices.len());
        println!("Failed devices: {}", self.failed_devices());
        println!("Events sent: {}", self.totals.grand_total);
        println!("Avg events/s: {:.2}", self.events_per_second());
        if self.sender_close_failures > 0 {
            println!("Sender close failures: {}", self.sender_close_failures);
        }
    }
}

pub struct Fleet<F, P> {
    config: SimulatorConfig,
    scenarios: P,
    senders: F,
    diagnostics: Arc<dyn DiagnosticsSink>,
    observers: Vec<Arc<dyn CountObserver>>,
}

impl<F, P> Fleet<F, P>
where
    F: SenderFactory,
    P: ScenarioProvider,
{
    pub fn new(config: SimulatorConfig, scenarios: P, senders: F) -> Self {
        Self {
            config,
            scenarios,
            senders,
            diagnostics: Arc::new(TracingDiagnostics),
            observers: vec![],
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CountObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Runs every device until it is terminal or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<FleetReport, FleetError> {
        let Fleet {
            config,
            scenarios,
            senders,
            diagnostics,
            observers,
        } = self;
        config.validate()?;
        let definitions = scenarios
            .entries(&config.scenario)
            .ok_or_else(|| FleetError::UnknownScenario(config.scenario.clone()))?;
        if definitions.is_empty() {
            return Err(FleetError::EmptyScenario(config.scenario.clone()));
        }
        let pool = SenderPool::build(
            &senders,
            config.sender_pool_size,
            config.close_timeout,
            diagnostics.clone(),
        )
        .await?;

        let device_count = config.devices_per_instance();
        if config.tick_interval.is_zero() {
            tracing::warn!(
                devices = device_count,
                "devices run unpaced; every tick only yields to the scheduler"
            );
        }
        diagnostics.record(&SimEvent::SimulationStarted {
            scenario: config.scenario.clone(),
            instance: config.instance_name.clone(),
            devices: device_count,
            sender_pool: pool.len(),
            warmup: config.warmup,
        });
        let started = Instant::now();

        let options = DeviceOptions {
            backoff: config.backoff,
            tick_interval: config.tick_interval,
        };
        let mut ids = Vec::with_capacity(device_count);
        let mut streams = Vec::with_capacity(device_count);
        let mut tasks = Vec::with_capacity(device_count);
        for (i, offset) in start_offsets(config.warmup, device_count)
            .into_iter()
            .enumerate()
        {
            let id: Arc<str> = format!("{}-{i}", config.instance_name).into();
            let (device, stream) = Device::new(
                id.clone(),
                &definitions,
                derive_device_seed(config.seed, i),
                pool.assign(i),
                diagnostics.clone(),
                options,
            );
            ids.push(id.clone());
            streams.push(stream);

            let cancel = cancel.clone();
            let diagnostics = diagnostics.clone();
            tasks.push(tokio::spawn(async move {
                if !offset.is_zero() && !pause(offset, &cancel).await {
                    return device.cancel_before_start();
                }
                diagnostics.record(&SimEvent::DeviceStarted { device: id, offset });
                device.run(cancel).await
            }));
        }

        let aggregator = Aggregator::new(config.report_window, diagnostics.clone())
            .with_observers(observers)
            .run(streams);
        let (results, totals) = tokio::join!(join_all(tasks), aggregator);

        let devices = results
            .into_iter()
            .zip(ids)
            .map(|(result, id)| match result {
                Ok(report) => report,
                Err(err) => {
                    let fault = DeviceFault::Panicked(err.to_string());
                    diagnostics.record(&SimEvent::DeviceFailed {
                        device: id.clone(),
                        fault: fault.clone(),
                    });
                    DeviceReport {
                        id,
                        sent: 0,
                        ticks: 0,
                        exit: DeviceExit::Failed(fault),
                    }
                }
            })
            .collect();

        let sender_close_failures = pool.release().await;
        let phase = if cancel.is_cancelled() {
            FleetPhase::Cancelled
        } else {
            FleetPhase::Completed
        };
        let elapsed = started.elapsed();
        diagnostics.record(&SimEvent::SimulationEnded {
            phase,
            total: totals.grand_total,
            elapsed,
        });
        Ok(FleetReport {
            phase,
            elapsed,
            totals,
            devices,
            sender_close_failures,
        })
    }
}

/// Fixed set of senders shared by the devices of a run.
pub struct SenderPool<S> {
    senders: Vec<Arc<S>>,
    close_timeout: Duration,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl<S: EventSender> SenderPool<S> {
    /// Creates `size` senders. If one fails, those already created are released.
    pub async fn build<F>(
        factory: &F,
        size: usize,
        close_timeout: Duration,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self, FleetError>
    where
        F: SenderFactory<Sender = S>,
    {
        let mut pool = Self {
            senders: Vec::with_capacity(size),
            close_timeout,
            diagnostics,
        };
        for slot in 0..size {
            match factory.create(slot) {
                Ok(sender) => pool.senders.push(Arc::new(sender)),
                Err(source) => {
                    pool.release().await;
                    return Err(FleetError::SenderPool { slot, source });
                }
            }
        }
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Sender for the device at `device_index`; the pool must not be empty.
    pub fn assign(&self, device_index: usize) -> Arc<S> {
        self.senders[device_index % self.senders.len()].clone()
    }

    /// Closes every sender concurrently, each bounded by the close timeout.
    ///
    /// Returns how many closes failed or timed out.
    pub async fn release(self) -> usize {
        let close_timeout = self.close_timeout;
        let closes = self.senders.iter().enumerate().map(|(slot, sender)| async move {
            match tokio::time::timeout(close_timeout, sender.close()).await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some((slot, err.to_string())),
                Err(_) => Some((slot, format!("close timed out after {close_timeout:?}"))),
            }
        });
        let mut failures = 0;
        for (slot, reason) in join_all(closes).await.into_iter().flatten() {
            failures += 1;
            self.diagnostics
                .record(&SimEvent::SenderCloseFailed { slot, reason });
        }
        failures
    }
}

/// Evenly spaced start delays: `warmup * i / n` for `i` in `0..n`.
pub fn start_offsets(warmup: Duration, n: usize) -> Vec<Duration> {
    let total = warmup.as_nanos();
    (0..n)
        .map(|i| {
            let nanos = total * i as u128 / n as u128;
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        })
        .collect()
}

pub fn derive_device_seed(run_seed: u64, device_index: usize) -> u64 {
    let mut seed = run_seed;
    seed = seed.wrapping_add(device_index as u64);
    seed ^= seed >> 33;
    seed = seed.wrapping_mul(0xff51afd7ed558ccd);
    seed ^= seed >> 33;
    seed = seed.wrapping_mul(0xc4ceb9fe1a85ec53);
    seed ^= seed >> 33;
    seed
}
