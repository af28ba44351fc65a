use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use apm_ingest::config::Config;
use apm_ingest::export::client_metric::ClientMetrics;
use apm_ingest::export::health::HealthMetrics;
use apm_ingest::pipeline::Pipeline;
use apm_ingest::store::{ClickHouseStore, MemoryStore, Store};

/// Multi-tenant APM telemetry ingestion service.
#[derive(Parser)]
#[command(name = "apm-ingest", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Log batches instead of writing them to ClickHouse.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn version() -> String {
    format!(
        "{} (commit: {}, {}/{})",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_COMMIT").unwrap_or("unknown"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("apm-ingest {}", version());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(version = %version(), dry_run = cli.dry_run, "starting apm-ingest");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, cli.dry_run).await })
}

async fn run(cfg: Config, dry_run: bool) -> Result<()> {
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    health.start().await.context("starting health server")?;

    let client_metrics = if cfg.client_metric.enabled {
        Some(Arc::new(
            ClientMetrics::new(health.registry(), cfg.client_metric.with_url)
                .context("registering client metrics")?,
        ))
    } else {
        None
    };

    if dry_run {
        serve(cfg, Arc::new(MemoryStore::dry_run()), health, client_metrics).await
    } else {
        let store = ClickHouseStore::connect(cfg.clickhouse.clone())
            .await
            .context("connecting to ClickHouse")?;
        health.clickhouse_connected.set(1.0);

        let result = serve(cfg, Arc::new(store), Arc::clone(&health), client_metrics).await;
        health.clickhouse_connected.set(0.0);
        result
    }
}

async fn serve<S: Store>(
    cfg: Config,
    store: Arc<S>,
    health: Arc<HealthMetrics>,
    client_metrics: Option<Arc<ClientMetrics>>,
) -> Result<()> {
    let mut pipeline = Pipeline::new(cfg, store, Some(Arc::clone(&health)), client_metrics);
    pipeline.start().await?;

    wait_for_shutdown().await?;

    pipeline.stop().await?;
    health.stop().await?;

    tracing::info!("apm-ingest stopped");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
