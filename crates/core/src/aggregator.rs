//! Fan-in of every device's count stream into fleet-wide totals.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    counts::{CountEvent, CountObserver, CountStream, DeviceCount},
    device::DeviceFault,
    tracing::{DiagnosticsSink, SimEvent},
};

pub const DEFAULT_REPORT_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum DeviceStatus {
    Running,
    Completed,
    Failed(DeviceFault),
    /// The stream closed without a terminal signal.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct DeviceTally {
    pub sent: u64,
    pub status: DeviceStatus,
}

#[derive(Debug, Clone, Default)]
pub struct FleetTotals {
    pub grand_total: u64,
    pub devices: BTreeMap<Arc<str>, DeviceTally>,
    /// Number of report windows that elapsed during the run.
    pub windows: u64,
}

impl FleetTotals {
    pub fn sum_of_devices(&self) -> u64 {
        self.devices.values().map(|t| t.sent).sum()
    }

    pub fn count_with(&self, status: impl Fn(&DeviceStatus) -> bool) -> usize {
        self.devices.values().filter(|t| status(&t.status)).count()
    }

    pub fn failed(&self) -> usize {
        self.count_with(|s| matches!(s, DeviceStatus::Failed(_)))
    }

    pub fn completed(&self) -> usize {
        self.count_with(|s| matches!(s, DeviceStatus::Completed))
    }
}

/// The single consumer of the merged count stream and the only writer of the totals.
pub struct Aggregator {
    window: Duration,
    diagnostics: Arc<dyn DiagnosticsSink>,
    observers: Vec<Arc<dyn CountObserver>>,
}

impl Aggregator {
    /// A zero `window` disables windowed reporting.
    pub fn new(window: Duration, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            window,
            diagnostics,
            observers: vec![],
        }
    }

    pub fn with_observers(mut self, observers: Vec<Arc<dyn CountObserver>>) -> Self {
        self.observers = observers;
        self
    }

    /// Consumes the streams until every one of them has ended.
    pub async fn run(self, streams: Vec<CountStream>) -> FleetTotals {
        let mut totals = FleetTotals {
            devices: streams
                .iter()
                .map(|s| {
                    (
                        s.device().clone(),
                        DeviceTally {
                            sent: 0,
                            status: DeviceStatus::Running,
                        },
                    )
                })
                .collect(),
            ..Default::default()
        };
        let mut merged = futures::stream::select_all(streams);

        let windowed = !self.window.is_zero();
        let period = self.window.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut window_total = 0;

        loop {
            tokio::select! {
                count = merged.next() => {
                    let Some(count) = count else { break };
                    window_total += self.apply(&mut totals, count);
                }
                _ = ticker.tick(), if windowed => {
                    totals.windows += 1;
                    self.diagnostics.record(&SimEvent::WindowTotal {
                        window: window_total,
                        running_total: totals.grand_total,
                    });
                    for observer in &self.observers {
                        observer.on_window(window_total, totals.grand_total);
                    }
                    window_total = 0;
                }
            }
        }

        for (device, tally) in totals.devices.iter_mut() {
            if matches!(tally.status, DeviceStatus::Running) {
                tracing::warn!(%device, "count stream closed without a terminal signal");
                tally.status = DeviceStatus::Abandoned;
            }
            self.diagnostics.record(&SimEvent::DeviceTotal {
                device: device.clone(),
                sent: tally.sent,
                status: tally.status.clone(),
            });
        }
        self.diagnostics.record(&SimEvent::FinalTotal {
            total: totals.grand_total,
        });
        totals
    }

    /// Returns how many events the signal adds to the totals.
    fn apply(&self, totals: &mut FleetTotals, count: DeviceCount) -> u64 {
        let DeviceCount { device, event } = count;
        let tally = totals
            .devices
            .entry(device.clone())
            .or_insert_with(|| DeviceTally {
                sent: 0,
                status: DeviceStatus::Running,
            });
        match event {
            CountEvent::Sent(n) => {
                tally.sent += n;
                totals.grand_total += n;
                for observer in &self.observers {
                    observer.on_event_sent(&device, n);
                }
                n
            }
            CountEvent::Error(fault) => {
                for observer in &self.observers {
                    observer.on_error(&device, &fault);
                }
                tally.status = DeviceStatus::Failed(fault);
                0
            }
            CountEvent::Completed => {
                tally.status = DeviceStatus::Completed;
                for observer in &self.observers {
                    observer.on_completed(&device);
                }
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::{counts::count_channel, schedule::GenerateError, tracing::MemoryDiagnostics};

    #[derive(Default)]
    struct Recorder {
        sent: AtomicU64,
        errors: AtomicU64,
        completed: AtomicU64,
        windows: AtomicU64,
    }

    impl CountObserver for Recorder {
        fn on_event_sent(&self, _device: &str, count: u64) {
            self.sent.fetch_add(count, Ordering::SeqCst);
        }

        fn on_error(&self, _device: &str, _fault: &DeviceFault) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_completed(&self, _device: &str) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_window(&self, _window_total: u64, _running_total: u64) {
            self.windows.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn totals_match_per_device_counts() {
        let (a, a_stream) = count_channel("host-0".into());
        let (b, b_stream) = count_channel("host-1".into());
        let (c, c_stream) = count_channel("host-2".into());
        for _ in 0..3 {
            a.event_sent();
        }
        b.event_sent();
        a.complete();
        b.fail(DeviceFault::Generate(GenerateError::new("Heartbeat", "boom")));
        drop(c);

        let recorder = Arc::new(Recorder::default());
        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let totals = Aggregator::new(Duration::ZERO, diagnostics.clone())
            .with_observers(vec![recorder.clone()])
            .run(vec![a_stream, b_stream, c_stream])
            .await;

        assert_eq!(totals.grand_total, 4);
        assert_eq!(totals.sum_of_devices(), 4);
        assert_eq!(totals.devices["host-0"].sent, 3);
        assert!(matches!(totals.devices["host-0"].status, DeviceStatus::Completed));
        assert!(matches!(totals.devices["host-1"].status, DeviceStatus::Failed(_)));
        assert!(matches!(totals.devices["host-2"].status, DeviceStatus::Abandoned));
        assert_eq!((totals.completed(), totals.failed()), (1, 1));

        assert_eq!(recorder.sent.load(Ordering::SeqCst), 4);
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
        assert_eq!(
            diagnostics.count(|e| matches!(e, SimEvent::DeviceTotal { .. })),
            3
        );
        assert!(matches!(
            diagnostics.events().last(),
            Some(SimEvent::FinalTotal { total: 4 })
        ));
    }

    #[test_log::test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn reports_windowed_totals() {
        let (publisher, stream) = count_channel("host-0".into());
        let recorder = Arc::new(Recorder::default());
        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let aggregator = Aggregator::new(Duration::from_secs(10), diagnostics.clone())
            .with_observers(vec![recorder.clone()]);
        let handle = tokio::spawn(aggregator.run(vec![stream]));

        for _ in 0..3 {
            publisher.event_sent();
        }
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        publisher.event_sent();
        publisher.event_sent();
        tokio::time::sleep(Duration::from_secs(10)).await;
        publisher.complete();
        let totals = handle.await.unwrap();

        assert_eq!(totals.grand_total, 5);
        assert_eq!(totals.windows, 2);
        let windows: Vec<_> = diagnostics
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::WindowTotal {
                    window,
                    running_total,
                } => Some((window, running_total)),
                _ => None,
            })
            .collect();
        assert_eq!(windows, vec![(3, 3), (2, 5)]);
        assert_eq!(recorder.windows.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_streams_yields_empty_totals() {
        let totals = Aggregator::new(DEFAULT_REPORT_WINDOW, Arc::new(MemoryDiagnostics::new()))
            .run(vec![])
            .await;
        assert_eq!(totals.grand_total, 0);
        assert!(totals.devices.is_empty());
    }
}
