//! Delivery of telemetry events to the ingestion sink.
//!
//! The simulator only depends on the [`EventSender`] capability: a sender either
//! delivers an event (`Ok(true)`), asks the device to back off (`Ok(false)`), or
//! fails unexpectedly (`Err`). Each sender stands for one outbound connection and
//! is shared by every device assigned to its pool slot.

use std::future::Future;

use crate::scenario::TelemetryEvent;

mod dry_run;
mod http;

pub use self::{
    dry_run::{DryRunFactory, DryRunSender},
    http::{HttpSender, HttpSenderFactory},
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    #[error("failed encoding event: {0}")]
    Encoding(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("ingestion endpoint rejected event with status {0}")]
    Rejected(u16),
    #[error("invalid sender configuration: {0}")]
    Configuration(String),
    #[error("sender already closed")]
    Closed,
}

/// The send capability injected into every device.
pub trait EventSender: Send + Sync + 'static {
    /// `Ok(false)` signals backpressure: the event was not delivered and should be retried later.
    fn send(&self, event: &TelemetryEvent)
        -> impl Future<Output = Result<bool, SendError>> + Send;

    /// Releases the underlying connection. Called once, after every device stopped.
    fn close(&self) -> impl Future<Output = Result<(), SendError>> + Send;
}

/// Builds the senders of the fleet's pool, one per slot.
pub trait SenderFactory: Send + Sync {
    type Sender: EventSender;

    fn create(&self, slot: usize) -> Result<Self::Sender, SendError>;
}
