//! Scenario catalog: which events a simulated device emits and at what cadence.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    sync::Arc,
    time::Duration,
};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    device::DeviceState,
    schedule::{EntryDefinition, GenerateError, GenerationRule},
};

pub const NO_ERRORS_EXPECTED: &str = "no-errors-expected";
pub const THIRTY_SECONDS_FREQUENCY: &str = "thirty-seconds-frequency";
pub const HEARTBEAT: &str = "heartbeat";
pub const BURST: &str = "burst";

/// Baseline for devices that have not reported a temperature yet.
const BASE_TEMPERATURE: f32 = 20.0;
const MAX_TEMPERATURE_DRIFT: f32 = 0.5;

/// A single telemetry event as handed to the send capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub device_id: String,
    pub sequence: u64,
    #[serde(flatten)]
    pub reading: Reading,
}

impl TelemetryEvent {
    pub fn new(state: &DeviceState, reading: Reading) -> Self {
        Self {
            device_id: state.id().to_owned(),
            sequence: state.sequence(),
            reading,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.reading.event_type()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reading {
    UpdateTemperature { temperature: f32 },
    Heartbeat,
}

impl Reading {
    /// Short name consumers use to route the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Reading::UpdateTemperature { .. } => "UpdateTemperature",
            Reading::Heartbeat => "Heartbeat",
        }
    }
}

/// Built-in generation rules selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Temperature,
    Heartbeat,
}

impl EventKind {
    pub fn rule(self) -> GenerationRule {
        match self {
            EventKind::Temperature => Arc::new(temperature_reading),
            EventKind::Heartbeat => Arc::new(heartbeat),
        }
    }
}

fn heartbeat(state: &DeviceState) -> Result<TelemetryEvent, GenerateError> {
    Ok(TelemetryEvent::new(state, Reading::Heartbeat))
}

/// Random walk around the last reported temperature, seeded by device and sequence.
fn temperature_reading(state: &DeviceState) -> Result<TelemetryEvent, GenerateError> {
    let mut rng = SmallRng::seed_from_u64(state.seed() ^ state.sequence().rotate_left(17));
    let temperature = match state.current_temperature() {
        Some(last) => last + rng.gen_range(-MAX_TEMPERATURE_DRIFT..=MAX_TEMPERATURE_DRIFT),
        None => BASE_TEMPERATURE + rng.gen_range(-5.0..=5.0),
    };
    if !temperature.is_finite() {
        return Err(GenerateError::new(
            "UpdateTemperature",
            format!("temperature diverged to {temperature}"),
        ));
    }
    Ok(TelemetryEvent::new(
        state,
        Reading::UpdateTemperature { temperature },
    ))
}

/// Serializable form of an entry, as written in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySpec {
    pub event: EventKind,
    pub interval_ms: u64,
    #[serde(default)]
    pub jitter: f64,
}

impl EntrySpec {
    pub fn to_definition(&self) -> EntryDefinition {
        EntryDefinition::from_rule(Duration::from_millis(self.interval_ms), self.event.rule())
            .with_jitter(self.jitter)
    }
}

/// Resolves a scenario name to the ordered entries every device of the run receives.
pub trait ScenarioProvider: Send + Sync {
    fn entries(&self, scenario: &str) -> Option<Vec<EntryDefinition>>;
}

impl<F> ScenarioProvider for F
where
    F: Fn(&str) -> Option<Vec<EntryDefinition>> + Send + Sync,
{
    fn entries(&self, scenario: &str) -> Option<Vec<EntryDefinition>> {
        self(scenario)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("scenario `{0}` is already defined")]
    Duplicate(String),
    #[error("scenario `{0}` has no entries")]
    Empty(String),
}

#[derive(Debug, Clone, Default)]
pub struct ScenarioCatalog {
    scenarios: BTreeMap<String, Vec<EntryDefinition>>,
}

impl ScenarioCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the stock scenarios.
    pub fn builtin() -> Self {
        let spec = |event, interval_ms, jitter| EntrySpec {
            event,
            interval_ms,
            jitter,
        };
        let mut catalog = Self::new();
        let builtins = [
            (
                NO_ERRORS_EXPECTED,
                vec![spec(EventKind::Temperature, 1_000, 0.1)],
            ),
            (
                THIRTY_SECONDS_FREQUENCY,
                vec![spec(EventKind::Temperature, 30_000, 0.1)],
            ),
            (
                HEARTBEAT,
                vec![
                    spec(EventKind::Heartbeat, 5_000, 0.0),
                    spec(EventKind::Temperature, 10_000, 0.1),
                ],
            ),
            (BURST, vec![spec(EventKind::Temperature, 0, 0.0)]),
        ];
        for (name, specs) in builtins {
            catalog
                .scenarios
                .insert(name.to_owned(), specs.iter().map(EntrySpec::to_definition).collect());
        }
        catalog
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        entries: Vec<EntryDefinition>,
    ) -> Result<(), ScenarioError> {
        let name = name.into();
        if entries.is_empty() {
            return Err(ScenarioError::Empty(name));
        }
        match self.scenarios.entry(name) {
            Entry::Occupied(e) => Err(ScenarioError::Duplicate(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(entries);
                Ok(())
            }
        }
    }

    /// Adds scenarios read from configuration.
    pub fn with_specs<'a>(
        mut self,
        specs: impl IntoIterator<Item = (&'a String, &'a Vec<EntrySpec>)>,
    ) -> Result<Self, ScenarioError> {
        for (name, entries) in specs {
            self.insert(
                name.clone(),
                entries.iter().map(EntrySpec::to_definition).collect(),
            )?;
        }
        Ok(self)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(String::as_str)
    }
}

impl ScenarioProvider for ScenarioCatalog {
    fn entries(&self, scenario: &str) -> Option<Vec<EntryDefinition>> {
        self.scenarios.get(scenario).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_is_short_variant_name() {
        let evt = Reading::UpdateTemperature { temperature: 1.0 };
        assert_eq!(evt.event_type(), "UpdateTemperature");
        assert_eq!(Reading::Heartbeat.event_type(), "Heartbeat");
    }

    #[test]
    fn serialized_event_carries_type_tag() {
        let state = DeviceState::new("host-3".into(), 7);
        let event = TelemetryEvent::new(&state, Reading::UpdateTemperature { temperature: 21.5 });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "UpdateTemperature");
        assert_eq!(json["device_id"], "host-3");
        assert_eq!(json["temperature"], 21.5);
        let back: TelemetryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn temperature_rule_is_pure() {
        let rule = EventKind::Temperature.rule();
        let state = DeviceState::new("host-0".into(), 99);
        let first = rule(&state).unwrap();
        let second = rule(&state).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn temperature_drifts_from_last_reading() {
        let rule = EventKind::Temperature.rule();
        let mut state = DeviceState::new("host-0".into(), 5);
        let first = rule(&state).unwrap();
        state.record(&first);
        let Reading::UpdateTemperature { temperature } = rule(&state).unwrap().reading else {
            panic!("expected a temperature reading");
        };
        let last = state.current_temperature().unwrap();
        assert!((temperature - last).abs() <= MAX_TEMPERATURE_DRIFT);
    }

    #[test]
    fn builtin_catalog_resolves_known_names() {
        let catalog = ScenarioCatalog::builtin();
        let entries = catalog.entries(NO_ERRORS_EXPECTED).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].interval(), Duration::from_secs(1));
        assert!(catalog.entries("does-not-exist").is_none());
        assert_eq!(catalog.names().count(), 4);
    }

    #[test]
    fn specs_parse_from_toml() {
        #[derive(Deserialize)]
        struct File {
            scenarios: BTreeMap<String, Vec<EntrySpec>>,
        }
        let file: File = toml::from_str(
            r#"
            [scenarios]
            slow = [
                { event = "temperature", interval_ms = 60000, jitter = 0.2 },
                { event = "heartbeat", interval_ms = 15000 },
            ]
            "#,
        )
        .unwrap();
        let catalog = ScenarioCatalog::new().with_specs(&file.scenarios).unwrap();
        let entries = catalog.entries("slow").unwrap();
        assert_eq!(entries[0].interval(), Duration::from_secs(60));
        assert_eq!(entries[0].jitter(), 0.2);
        assert_eq!(entries[1].jitter(), 0.0);
    }

    #[test]
    fn duplicate_and_empty_scenarios_are_rejected() {
        let mut catalog = ScenarioCatalog::builtin();
        let dup = catalog.insert(BURST, EventKind::Heartbeat.rule_entries());
        assert!(matches!(dup, Err(ScenarioError::Duplicate(name)) if name == BURST));
        assert!(matches!(
            catalog.insert("nothing", vec![]),
            Err(ScenarioError::Empty(_))
        ));
    }

    #[test]
    fn closures_act_as_providers() {
        let provider = |name: &str| (name == "one").then(|| EventKind::Heartbeat.rule_entries());
        assert!(provider.entries("one").is_some());
        assert!(provider.entries("two").is_none());
    }

    impl EventKind {
        fn rule_entries(self) -> Vec<EntryDefinition> {
            vec![EntryDefinition::from_rule(Duration::from_secs(1), self.rule())]
        }
    }
}
