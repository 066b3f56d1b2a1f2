use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use devsim::{
    config::{ConfigArgs, SimulatorConfig},
    fleet::{Fleet, FleetReport},
    scenario::{ScenarioCatalog, ScenarioProvider},
    tracing::{CombinedDiagnostics, DiagnosticsSink, LatencyLog, TracingDiagnostics},
    transport::{DryRunFactory, HttpSenderFactory, SenderFactory},
};
use tokio_util::sync::CancellationToken;

fn main() -> anyhow::Result<()> {
    let config = ConfigArgs::parse().build()?;
    devsim::config::set_logger(config.log_level);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed building the async runtime")?;
    let report = rt.block_on(run(config))?;
    report.print();
    Ok(())
}

async fn run(config: SimulatorConfig) -> anyhow::Result<FleetReport> {
    let catalog = ScenarioCatalog::builtin().with_specs(&config.scenarios)?;
    tracing::info!(
        seed = config.seed,
        scenarios = ?catalog.names().collect::<Vec<_>>(),
        "loaded scenario catalog"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping devices");
                cancel.cancel();
            }
        });
    }
    if let Some(duration) = config.run_duration {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            tracing::info!(?duration, "run duration elapsed, stopping devices");
            cancel.cancel();
        });
    }

    let mut sinks: Vec<Arc<dyn DiagnosticsSink>> = vec![Arc::new(TracingDiagnostics)];
    let latency_log = match &config.latency_log {
        Some(path) => {
            let log = Arc::new(LatencyLog::open(path).await?);
            sinks.push(log.clone());
            Some(log)
        }
        None => None,
    };
    let diagnostics = Arc::new(CombinedDiagnostics::new(sinks));

    let report = match config.sink.endpoint.clone() {
        Some(endpoint) => {
            tracing::info!(%endpoint, "posting events to ingestion endpoint");
            let factory = HttpSenderFactory::new(&endpoint, config.sink.request_timeout)?;
            simulate(config, catalog, factory, diagnostics, cancel).await?
        }
        None => {
            tracing::info!("no endpoint configured, events are only logged");
            let factory = DryRunFactory::new(config.sink.dry_run_throttle, config.seed);
            simulate(config, catalog, factory, diagnostics, cancel).await?
        }
    };

    if let Some(log) = latency_log {
        log.flush().await?;
        if log.dropped() > 0 {
            tracing::warn!(dropped = log.dropped(), "latency log could not keep up");
        }
    }
    Ok(report)
}

async fn simulate<F, P>(
    config: SimulatorConfig,
    scenarios: P,
    senders: F,
    diagnostics: Arc<dyn DiagnosticsSink>,
    cancel: CancellationToken,
) -> anyhow::Result<FleetReport>
where
    F: SenderFactory,
    P: ScenarioProvider,
{
    let report = Fleet::new(config, scenarios, senders)
        .with_diagnostics(diagnostics)
        .run(cancel)
        .await?;
    Ok(report)
}
