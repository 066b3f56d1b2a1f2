//! Per-device count streams and the observer contract for consuming them.
//!
//! Every device owns exactly one [`CountPublisher`]; the matching [`CountStream`]
//! is handed to the fleet aggregator, which merges all of them and is the only
//! reader. Terminal signals consume the publisher, so nothing can be published
//! after a device reported an error or completion.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    Stream,
};

use crate::device::DeviceFault;

#[derive(Debug, Clone)]
pub enum CountEvent {
    /// Number of events delivered since the previous signal (always 1 from devices).
    Sent(u64),
    Error(DeviceFault),
    Completed,
}

impl CountEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CountEvent::Error(_) | CountEvent::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceCount {
    pub device: Arc<str>,
    pub event: CountEvent,
}

pub fn count_channel(device: Arc<str>) -> (CountPublisher, CountStream) {
    let (tx, rx) = mpsc::unbounded();
    (
        CountPublisher {
            device: device.clone(),
            tx,
        },
        CountStream { device, rx },
    )
}

/// Producer half, owned by a single device.
#[derive(Debug)]
pub struct CountPublisher {
    device: Arc<str>,
    tx: UnboundedSender<DeviceCount>,
}

impl CountPublisher {
    pub fn event_sent(&self) {
        self.publish(CountEvent::Sent(1));
    }

    pub fn fail(self, fault: DeviceFault) {
        self.publish(CountEvent::Error(fault));
    }

    pub fn complete(self) {
        self.publish(CountEvent::Completed);
    }

    fn publish(&self, event: CountEvent) {
        let count = DeviceCount {
            device: self.device.clone(),
            event,
        };
        if self.tx.unbounded_send(count).is_err() {
            tracing::trace!(device = %self.device, "count stream consumer gone");
        }
    }
}

/// Consumer half; yields the device's signals until its publisher is dropped.
#[derive(Debug)]
pub struct CountStream {
    device: Arc<str>,
    rx: UnboundedReceiver<DeviceCount>,
}

impl CountStream {
    pub fn device(&self) -> &Arc<str> {
        &self.device
    }
}

impl Stream for CountStream {
    type Item = DeviceCount;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

/// External subscriber to the fleet-wide count stream.
///
/// Observers are notified by the aggregator task in stream order and must not block.
pub trait CountObserver: Send + Sync + 'static {
    fn on_event_sent(&self, _device: &str, _count: u64) {}

    fn on_error(&self, _device: &str, _fault: &DeviceFault) {}

    fn on_completed(&self, _device: &str) {}

    /// Called once per report window with the window's count and the running total.
    fn on_window(&self, _window_total: u64, _running_total: u64) {}
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::schedule::GenerateError;

    #[tokio::test]
    async fn stream_yields_signals_in_order() {
        let (publisher, mut stream) = count_channel("dev-1".into());
        assert_eq!(&**stream.device(), "dev-1");
        publisher.event_sent();
        publisher.event_sent();
        publisher.complete();

        let mut seen = vec![];
        while let Some(count) = stream.next().await {
            assert_eq!(&*count.device, "dev-1");
            seen.push(count.event);
        }
        assert!(matches!(seen[0], CountEvent::Sent(1)));
        assert!(matches!(seen[1], CountEvent::Sent(1)));
        assert!(matches!(seen[2], CountEvent::Completed));
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn error_is_terminal() {
        let (publisher, mut stream) = count_channel("dev-2".into());
        publisher.fail(DeviceFault::Generate(GenerateError::new("Heartbeat", "boom")));
        let count = stream.next().await.unwrap();
        assert!(count.event.is_terminal());
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn publishing_without_consumer_is_silent() {
        let (publisher, stream) = count_channel("dev-3".into());
        drop(stream);
        publisher.event_sent();
        publisher.complete();
    }
}
