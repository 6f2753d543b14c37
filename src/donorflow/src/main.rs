//! Donorflow: journey automation daemon for donor communications.
//!
//! Loads configuration, wires the journey engine to its collaborators and
//! runs the scheduler until Ctrl-C.

mod demo;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use donorflow_core::config::{AppConfig, MetricsConfig};
use donorflow_core::event_bus::TracingSink;
use donorflow_journey::collaborators::{InMemoryContacts, InMemoryDonations, TracingChannelSender};
use donorflow_journey::{Collaborators, JourneyEngine};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "donorflow")]
#[command(about = "Journey automation engine for donor communications")]
#[command(version)]
struct Cli {
    /// Optional TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Node identifier (overrides config)
    #[arg(long, env = "DONORFLOW__NODE_ID")]
    node_id: Option<String>,

    /// Scheduler tick interval in seconds (overrides config)
    #[arg(long, env = "DONORFLOW__JOURNEY__TICK_INTERVAL_SECS")]
    tick_interval_secs: Option<u64>,

    /// Runs executed in parallel per tick (overrides config)
    #[arg(long, env = "DONORFLOW__JOURNEY__WORKER_POOL_SIZE")]
    workers: Option<usize>,

    /// Seed a demo journey and a few contacts
    #[arg(long, default_value_t = false)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "donorflow=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Donorflow starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.tick_interval_secs {
        config.journey.tick_interval_secs = secs.max(1);
    }
    if let Some(workers) = cli.workers {
        config.journey.worker_pool_size = workers.max(1);
    }

    info!(
        node_id = %config.node_id,
        tick_interval_secs = config.journey.tick_interval_secs,
        workers = config.journey.worker_pool_size,
        max_dispatch_attempts = config.journey.max_dispatch_attempts,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        if let Err(e) = start_metrics(&config.metrics) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let contacts = Arc::new(InMemoryContacts::new());
    let donations = Arc::new(InMemoryDonations::new());
    let collaborators = Collaborators::new(
        Arc::new(TracingChannelSender),
        donations.clone(),
        contacts.clone(),
    )
    .with_event_sink(Arc::new(TracingSink));
    let engine = JourneyEngine::new(config.journey.clone(), collaborators);

    if cli.demo {
        demo::seed(&engine, &contacts, &donations).await?;
    }

    if !config.journey.enabled {
        warn!("Journey scheduler disabled by config, exiting");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = engine.spawn_scheduler(shutdown_rx);

    info!("Donorflow is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing current tick");
    let _ = shutdown_tx.send(true);
    scheduler.await?;

    info!("Donorflow stopped");
    Ok(())
}

fn start_metrics(metrics: &MetricsConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(metrics.host.parse()?, metrics.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = metrics.port, "Metrics exporter started");
    Ok(())
}
