//! riptide-writer: bus -> hot analytical store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use bus::BusClient;
use config::PipelineConfig;
use health::{HealthServer, ServiceHealth, StatsRegistry};
use store::{create_database_sql, create_table_sql, ClickHouseClient};
use types::venue::DataType;
use writer_service::batcher::spawn_batchers;
use writer_service::consumer::{Consumer, ConsumerCounters};
use writer_service::error_log::ErrorLog;

#[derive(Parser)]
#[command(name = "riptide-writer", about = "Hot-tier market data writer")]
struct Args {
    /// Pipeline configuration file (TOML). Defaults apply when omitted.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

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
    let service_health = ServiceHealth::new("riptide-writer");
    let health_port = args.health_port.unwrap_or(config.health.writer_port);
    tokio::spawn(
        HealthServer::new(service_health.clone(), stats.clone(), health_port).run(),
    );

    let hot = Arc::new(
        ClickHouseClient::new(&config.storage.hot).context("hot store client")?,
    );
    provision_tables(&hot, &config).await.context("hot schema")?;
    service_health.set_healthy("store");

    let bus = Arc::new(
        BusClient::connect(&config.bus)
            .await
            .context("bus connection failed")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let error_log = Arc::new(ErrorLog::new(config.writer.error_log_path.clone()));
    let (batchers, batcher_handles) = spawn_batchers(
        &config.writer,
        hot,
        error_log,
        &stats,
        shutdown_rx.clone(),
    );

    let consumer = Consumer::new(
        bus,
        config.writer.durable_name.clone(),
        Arc::new(batchers),
        ConsumerCounters::new(&stats),
        service_health.clone(),
    );
    let consumer_handle = tokio::spawn(consumer.run(shutdown_rx));

    info!("riptide-writer running");
    wait_for_signal().await;
    info!("shutdown signal received, flushing batches");
    let _ = shutdown_tx.send(true);

    let mut handles = batcher_handles;
    handles.push(consumer_handle);
    let drain = futures_util::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("drain deadline exceeded, exiting anyway");
    }
    Ok(())
}

async fn provision_tables(hot: &ClickHouseClient, config: &PipelineConfig) -> anyhow::Result<()> {
    hot.execute(&create_database_sql(hot.database())).await?;
    for data_type in DataType::ALL {
        hot.execute(&create_table_sql(
            hot.database(),
            data_type,
            config.storage.hot_ttl_days,
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
