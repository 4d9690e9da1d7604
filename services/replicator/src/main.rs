//! riptide-replicator: hot -> cold window replication.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use config::PipelineConfig;
use health::{HealthServer, HealthStatus, ServiceHealth, StatsRegistry};
use replicator_service::replicate::Replicator;
use replicator_service::watermark::WatermarkStore;
use store::{create_database_sql, create_table_sql, ClickHouseClient};
use types::venue::DataType;

#[derive(Parser)]
#[command(name = "riptide-replicator", about = "Hot to cold window replication")]
struct Args {
    /// Pipeline configuration file (TOML). Defaults apply when omitted.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Run one replication pass and exit.
    #[arg(long)]
    once: bool,

    /// Override the health/stats port from the configuration.
    #[arg(long)]
    health_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config =
        PipelineConfig::load(args.config.as_deref()).context("configuration rejected")?;
    init_tracing(&config.log);

    let stats = StatsRegistry::new();
    let service_health = ServiceHealth::new("riptide-replicator");
    let health_port = args.health_port.unwrap_or(config.health.replicator_port);
    tokio::spawn(
        HealthServer::new(service_health.clone(), stats.clone(), health_port).run(),
    );

    let hot = Arc::new(
        ClickHouseClient::new(&config.storage.hot).context("hot store client")?,
    );
    let cold = Arc::new(
        ClickHouseClient::new(&config.storage.cold).context("cold store client")?,
    );
    provision_cold(&cold, &config).await.context("cold schema")?;
    service_health.set_healthy("store");

    let watermarks = WatermarkStore::load(config.replicator.watermark_path.clone());
    let mut replicator = Replicator::new(
        hot,
        cold,
        &config.storage,
        config.replicator.clone(),
        watermarks,
        stats.clone(),
    );

    if args.once {
        let failures = replicator.run_once().await;
        anyhow::ensure!(failures == 0, "{failures} tables failed to replicate");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = Duration::from_secs(config.replicator.interval_hours * 3600);
    let runner = tokio::spawn(run_schedule(
        replicator,
        interval,
        service_health.clone(),
        shutdown_rx,
    ));

    info!(
        interval_hours = config.replicator.interval_hours,
        "riptide-replicator running"
    );
    wait_for_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // The current window finishes or the watermark stays put; either way
    // the next start resumes correctly.
    if tokio::time::timeout(Duration::from_secs(10), runner).await.is_err() {
        warn!("drain deadline exceeded, exiting anyway");
    }
    Ok(())
}

async fn run_schedule(
    mut replicator: Replicator,
    interval: Duration,
    service_health: Arc<ServiceHealth>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_clean_run = Instant::now();

    loop {
        tokio::select! {
            biased;

            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    return;
                }
            }

            _ = ticker.tick() => {
                let failures = replicator.run_once().await;
                if failures == 0 {
                    last_clean_run = Instant::now();
                    service_health.set_healthy("replication");
                } else if last_clean_run.elapsed() > interval * 2 {
                    // Watermark stalled beyond two intervals: raise the
                    // cross-cutting alert.
                    service_health.set_check(
                        "replication",
                        HealthStatus::Degraded,
                        Some(format!("{failures} tables failing, watermark stalled")),
                    );
                }
            }
        }
    }
}

async fn provision_cold(cold: &ClickHouseClient, config: &PipelineConfig) -> anyhow::Result<()> {
    cold.execute(&create_database_sql(cold.database())).await?;
    for data_type in DataType::ALL {
        cold.execute(&create_table_sql(
            cold.database(),
            data_type,
            config.storage.cold_ttl_days,
        ))
        .await?;
    }
    Ok(())
}

fn init_tracing(log: &config::LogConfig) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(&log.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
