//! Senders and helpers shared by the fleet integration tests.
#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use devsim::{
    config::SimulatorConfig,
    scenario::{Reading, TelemetryEvent},
    schedule::EntryDefinition,
    transport::{EventSender, SendError, SenderFactory},
};
use tokio_util::sync::CancellationToken;

pub fn config(devices: usize, warmup: Duration) -> SimulatorConfig {
    SimulatorConfig {
        scenario: "test".into(),
        devices,
        instance_name: "sim".into(),
        warmup,
        sender_pool_size: 2,
        seed: 7,
        report_window: Duration::ZERO,
        ..Default::default()
    }
}

pub fn heartbeat_every(interval: Duration) -> impl Fn(&str) -> Option<Vec<EntryDefinition>> {
    move |_| {
        Some(vec![EntryDefinition::new(interval, |state| {
            Ok(TelemetryEvent::new(state, Reading::Heartbeat))
        })])
    }
}

/// Behaviour shared by every sender of a pool, so limits apply fleet-wide.
#[derive(Clone, Default)]
pub struct Script {
    delivered: Arc<AtomicU64>,
    cancel_after: Option<(u64, CancellationToken)>,
    failing_device: Option<String>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the run once this many events were delivered.
    pub fn cancel_after(mut self, sends: u64, cancel: &CancellationToken) -> Self {
        self.cancel_after = Some((sends, cancel.clone()));
        self
    }

    /// Events from this device fail to send.
    pub fn failing_device(mut self, device: &str) -> Self {
        self.failing_device = Some(device.to_owned());
        self
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

pub struct ScriptedSender(Script);

impl EventSender for ScriptedSender {
    async fn send(&self, event: &TelemetryEvent) -> Result<bool, SendError> {
        if self.0.failing_device.as_deref() == Some(event.device_id.as_str()) {
            return Err(SendError::Rejected(500));
        }
        let delivered = self.0.delivered.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, cancel)) = &self.0.cancel_after {
            if delivered >= *limit {
                cancel.cancel();
            }
        }
        Ok(true)
    }

    async fn close(&self) -> Result<(), SendError> {
        Ok(())
    }
}

impl SenderFactory for Script {
    type Sender = ScriptedSender;

    fn create(&self, _slot: usize) -> Result<ScriptedSender, SendError> {
        Ok(ScriptedSender(self.clone()))
    }
}
