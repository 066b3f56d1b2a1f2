use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::{
    aggregator::DEFAULT_REPORT_WINDOW,
    device::DEFAULT_BACKOFF,
    scenario::{EntrySpec, NO_ERRORS_EXPECTED},
};

pub const DEFAULT_DEVICES: usize = 10;
pub const DEFAULT_INSTANCES: usize = 1;
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(10);
pub const DEFAULT_SENDER_POOL_SIZE: usize = 4;
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_INSTANCE_NAME: &str = "devsim";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed reading configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed parsing configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(clap::Parser, Debug, Clone, Default)]
#[command(name = "devsim", version, about = "Telemetry device fleet simulator")]
pub struct ConfigArgs {
    /// TOML file with settings; command line values take precedence.
    #[arg(long, env = "DEVSIM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Scenario every device runs.
    #[arg(long, env = "DEVSIM_SCENARIO")]
    pub scenario: Option<String>,

    /// Total number of devices across all instances.
    #[arg(long, env = "DEVSIM_DEVICES")]
    pub devices: Option<usize>,

    /// Number of simulator instances sharing the device count.
    #[arg(long, env = "DEVSIM_INSTANCES")]
    pub instances: Option<usize>,

    /// Prefix for device identifiers. Defaults to the host name.
    #[arg(long, env = "DEVSIM_INSTANCE_NAME")]
    pub instance_name: Option<String>,

    /// Window over which device starts are spread, in milliseconds.
    #[arg(long, env = "DEVSIM_WARMUP_MS")]
    pub warmup_ms: Option<u64>,

    #[arg(long, env = "DEVSIM_SENDER_POOL_SIZE")]
    pub sender_pool_size: Option<usize>,

    /// Delay after the sink signalled backpressure, in milliseconds.
    #[arg(long, env = "DEVSIM_BACKOFF_MS")]
    pub backoff_ms: Option<u64>,

    /// Pause between device ticks, in milliseconds. 0 only yields.
    #[arg(long, env = "DEVSIM_TICK_INTERVAL_MS")]
    pub tick_interval_ms: Option<u64>,

    /// Period of the windowed totals, in seconds. 0 disables them.
    #[arg(long, env = "DEVSIM_REPORT_WINDOW_SECS")]
    pub report_window_secs: Option<u64>,

    #[arg(long, env = "DEVSIM_CLOSE_TIMEOUT_MS")]
    pub close_timeout_ms: Option<u64>,

    /// Seed for every random choice of the run. Random when unset.
    #[arg(long, env = "DEVSIM_SEED")]
    pub seed: Option<u64>,

    /// Stop the simulation after this many seconds; runs until interrupted otherwise.
    #[arg(long, env = "DEVSIM_RUN_FOR_SECS")]
    pub run_for_secs: Option<u64>,

    /// Write one CSV row per delivered event to this file.
    #[arg(long, env = "DEVSIM_LATENCY_LOG")]
    pub latency_log: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,

    #[command(flatten)]
    pub sink: SinkArgs,
}

#[derive(clap::Parser, Debug, Clone, Default)]
pub struct SinkArgs {
    /// Ingestion endpoint events are posted to. Without it events are only logged.
    #[arg(long, env = "DEVSIM_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long, env = "DEVSIM_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Share of dry-run sends answered with backpressure, between 0 and 1.
    #[arg(long, env = "DEVSIM_DRY_RUN_THROTTLE")]
    pub dry_run_throttle: Option<f64>,
}

/// On-disk form of the configuration. Every key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub scenario: Option<String>,
    pub devices: Option<usize>,
    pub instances: Option<usize>,
    pub instance_name: Option<String>,
    pub warmup_ms: Option<u64>,
    pub sender_pool_size: Option<usize>,
    pub backoff_ms: Option<u64>,
    pub tick_interval_ms: Option<u64>,
    pub report_window_secs: Option<u64>,
    pub close_timeout_ms: Option<u64>,
    pub seed: Option<u64>,
    pub run_for_secs: Option<u64>,
    pub latency_log: Option<PathBuf>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub sink: SinkFile,
    /// Scenarios added to the built-in catalog.
    #[serde(default)]
    pub scenarios: BTreeMap<String, Vec<EntrySpec>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkFile {
    pub endpoint: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub dry_run_throttle: Option<f64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ConfigArgs {
    /// Merges the arguments over the configuration file over the defaults.
    pub fn build(mut self) -> Result<SimulatorConfig, ConfigError> {
        let file = match self.config.as_deref() {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        macro_rules! merge {
            ($($field:ident),+ $(,)?) => {
                $(if let Some(value) = file.$field {
                    self.$field.get_or_insert(value);
                })+
            };
        }
        merge!(
            scenario,
            devices,
            instances,
            instance_name,
            warmup_ms,
            sender_pool_size,
            backoff_ms,
            tick_interval_ms,
            report_window_secs,
            close_timeout_ms,
            seed,
            run_for_secs,
            latency_log,
        );
        if let Some(level) = file.log_level {
            let level = level
                .parse::<LevelFilter>()
                .map_err(|e| ConfigError::Invalid(format!("log_level `{level}`: {e}")))?;
            self.log_level.get_or_insert(level);
        }
        if let Some(endpoint) = file.sink.endpoint {
            self.sink.endpoint.get_or_insert(endpoint);
        }
        if let Some(timeout) = file.sink.request_timeout_ms {
            self.sink.request_timeout_ms.get_or_insert(timeout);
        }
        if let Some(ratio) = file.sink.dry_run_throttle {
            self.sink.dry_run_throttle.get_or_insert(ratio);
        }

        let defaults = SimulatorConfig::default();
        let config = SimulatorConfig {
            scenario: self.scenario.unwrap_or(defaults.scenario),
            devices: self.devices.unwrap_or(defaults.devices),
            instances: self.instances.unwrap_or(defaults.instances),
            instance_name: self.instance_name.unwrap_or(defaults.instance_name),
            warmup: self.warmup_ms.map_or(defaults.warmup, Duration::from_millis),
            sender_pool_size: self.sender_pool_size.unwrap_or(defaults.sender_pool_size),
            backoff: self.backoff_ms.map_or(defaults.backoff, Duration::from_millis),
            tick_interval: self
                .tick_interval_ms
                .map_or(defaults.tick_interval, Duration::from_millis),
            report_window: self
                .report_window_secs
                .map_or(defaults.report_window, Duration::from_secs),
            close_timeout: self
                .close_timeout_ms
                .map_or(defaults.close_timeout, Duration::from_millis),
            seed: self.seed.unwrap_or_else(rand::random),
            run_duration: self.run_for_secs.map(Duration::from_secs),
            latency_log: self.latency_log,
            log_level: self.log_level,
            sink: SinkConfig {
                endpoint: self.sink.endpoint,
                request_timeout: self
                    .sink
                    .request_timeout_ms
                    .map_or(defaults.sink.request_timeout, Duration::from_millis),
                dry_run_throttle: self
                    .sink
                    .dry_run_throttle
                    .unwrap_or(defaults.sink.dry_run_throttle),
            },
            scenarios: file.scenarios,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Immutable settings of one simulator run.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub scenario: String,
    pub devices: usize,
    pub instances: usize,
    pub instance_name: String,
    pub warmup: Duration,
    pub sender_pool_size: usize,
    pub backoff: Duration,
    pub tick_interval: Duration,
    pub report_window: Duration,
    pub close_timeout: Duration,
    pub seed: u64,
    pub run_duration: Option<Duration>,
    pub latency_log: Option<PathBuf>,
    pub log_level: Option<LevelFilter>,
    pub sink: SinkConfig,
    pub scenarios: BTreeMap<String, Vec<EntrySpec>>,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub endpoint: Option<String>,
    pub request_timeout: Duration,
    pub dry_run_throttle: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            scenario: NO_ERRORS_EXPECTED.to_owned(),
            devices: DEFAULT_DEVICES,
            instances: DEFAULT_INSTANCES,
            instance_name: default_instance_name(),
            warmup: DEFAULT_WARMUP,
            sender_pool_size: DEFAULT_SENDER_POOL_SIZE,
            backoff: DEFAULT_BACKOFF,
            tick_interval: Duration::ZERO,
            report_window: DEFAULT_REPORT_WINDOW,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            seed: 0,
            run_duration: None,
            latency_log: None,
            log_level: None,
            sink: SinkConfig {
                endpoint: None,
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                dry_run_throttle: 0.0,
            },
            scenarios: BTreeMap::new(),
        }
    }
}

impl SimulatorConfig {
    /// Devices this instance runs; any remainder of the division is not simulated.
    pub fn devices_per_instance(&self) -> usize {
        self.devices / self.instances.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.scenario.is_empty() {
            return invalid("scenario name is empty".into());
        }
        if self.instances == 0 {
            return invalid("instances must be at least 1".into());
        }
        if self.devices_per_instance() == 0 {
            return invalid(format!(
                "{} devices cannot be split over {} instances",
                self.devices, self.instances
            ));
        }
        if self.sender_pool_size == 0 {
            return invalid("sender_pool_size must be at least 1".into());
        }
        if self.instance_name.is_empty() {
            return invalid("instance_name is empty".into());
        }
        if self.close_timeout.is_zero() {
            return invalid("close_timeout must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.sink.dry_run_throttle) {
            return invalid(format!(
                "dry_run_throttle {} is outside [0, 1]",
                self.sink.dry_run_throttle
            ));
        }
        if self.sink.request_timeout.is_zero() {
            return invalid("request_timeout must be positive".into());
        }
        for (name, entries) in &self.scenarios {
            if entries.is_empty() {
                return invalid(format!("scenario `{name}` has no entries"));
            }
        }
        Ok(())
    }
}

/// Short host name, or a fixed fallback when it cannot be determined.
pub fn default_instance_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .and_then(|host| host.split('.').next().map(str::to_owned))
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| DEFAULT_INSTANCE_NAME.to_owned())
}

pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        use std::sync::atomic::{AtomicBool, Ordering};

        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(false, true, Ordering::Release, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if let Err(err) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {err}");
        }
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::*;
    use crate::scenario::EventKind;

    fn args(argv: &[&str]) -> ConfigArgs {
        ConfigArgs::try_parse_from(std::iter::once("devsim").chain(argv.iter().copied())).unwrap()
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_apply_without_arguments() -> testresult::TestResult {
        let config = args(&["--seed", "1"]).build()?;
        assert_eq!(config.scenario, NO_ERRORS_EXPECTED);
        assert_eq!(config.devices, DEFAULT_DEVICES);
        assert_eq!(config.warmup, DEFAULT_WARMUP);
        assert_eq!(config.backoff, Duration::from_secs(10));
        assert_eq!(config.tick_interval, Duration::ZERO);
        assert_eq!(config.report_window, Duration::from_secs(10));
        assert_eq!(config.seed, 1);
        assert!(config.sink.endpoint.is_none());
        Ok(())
    }

    #[test]
    fn file_values_fill_missing_arguments() -> testresult::TestResult {
        let file = config_file(
            r#"
            scenario = "slow"
            devices = 40
            instances = 2
            warmup_ms = 2000
            backoff_ms = 500
            log_level = "warn"

            [sink]
            endpoint = "http://localhost:8080/events"
            dry_run_throttle = 0.25

            [scenarios]
            slow = [{ event = "heartbeat", interval_ms = 60000 }]
            "#,
        );
        let path = file.path().to_str().unwrap();
        let config = args(&["--config", path, "--devices", "8", "--seed", "3"]).build()?;

        assert_eq!(config.scenario, "slow");
        assert_eq!(config.devices, 8);
        assert_eq!(config.instances, 2);
        assert_eq!(config.devices_per_instance(), 4);
        assert_eq!(config.warmup, Duration::from_secs(2));
        assert_eq!(config.backoff, Duration::from_millis(500));
        assert_eq!(config.log_level, Some(LevelFilter::WARN));
        assert_eq!(
            config.sink.endpoint.as_deref(),
            Some("http://localhost:8080/events")
        );
        assert_eq!(config.sink.dry_run_throttle, 0.25);
        assert_eq!(config.scenarios["slow"][0].event, EventKind::Heartbeat);
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = config_file("device = 3\n");
        let err = args(&["--config", file.path().to_str().unwrap()])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = args(&["--config", path.to_str().unwrap()])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for argv in [
            &["--devices", "1", "--instances", "2"][..],
            &["--instances", "0"],
            &["--sender-pool-size", "0"],
            &["--dry-run-throttle", "1.5"],
            &["--close-timeout-ms", "0"],
        ] {
            let err = args(argv).build().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{argv:?}");
        }
    }

    #[test]
    fn instance_name_falls_back() {
        assert!(!default_instance_name().is_empty());
    }

    #[test]
    fn set_logger_is_idempotent() {
        set_logger(Some(LevelFilter::WARN));
        set_logger(Some(LevelFilter::TRACE));
    }
}
