/// Fan-in of device counts into fleet totals.
pub mod aggregator;

/// Simulator configuration from command line, environment and file.
pub mod config;

/// Per-device count streams and their observers.
pub mod counts;

/// Simulated device and its event loop.
pub mod device;

/// Fleet orchestration: staggered start, sender pool, join and cleanup.
pub mod fleet;

/// Scenario catalog and the telemetry payloads.
pub mod scenario;

/// Recurring event schedule entries.
pub mod schedule;

/// Diagnostics sinks and logging setup.
pub mod tracing;

/// Delivery of events to the ingestion sink.
pub mod transport;

pub use crate::{
    aggregator::{Aggregator, DeviceStatus, FleetTotals},
    config::{ConfigArgs, SimulatorConfig},
    counts::CountObserver,
    device::{Device, DeviceExit, DeviceFault, DeviceOptions, DeviceReport, DeviceState},
    fleet::{Fleet, FleetError, FleetPhase, FleetReport},
    scenario::{ScenarioCatalog, ScenarioProvider, TelemetryEvent},
    schedule::{EntryDefinition, ScheduleEntry},
    transport::{EventSender, SendError, SenderFactory},
};
