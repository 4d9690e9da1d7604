//! riptide-ingest: venue streams -> canonical records -> bus.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use bus::BusClient;
use config::PipelineConfig;
use health::{HealthServer, HealthStatus, ServiceHealth, StatsRegistry};
use ingest_service::orderbook::DegradedSymbols;
use ingest_service::poller::{build_tasks, Poller, PollerCounters};
use ingest_service::publish::Publisher;
use ingest_service::rate_limit::VenueLimiter;
use ingest_service::supervisor::VenueSupervisor;
use ingest_service::venue::make_adapter;

#[derive(Parser)]
#[command(name = "riptide-ingest", about = "Multi-venue market data ingestion")]
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
    let service_health = ServiceHealth::new("riptide-ingest");
    let degraded = DegradedSymbols::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_port = args.health_port.unwrap_or(config.health.ingest_port);
    tokio::spawn(
        HealthServer::new(service_health.clone(), stats.clone(), health_port).run(),
    );

    let bus = Arc::new(
        BusClient::connect(&config.bus)
            .await
            .context("bus connection failed")?,
    );
    service_health.set_healthy("bus");

    let (publisher, publisher_handle) =
        Publisher::new(config.publisher.clone(), bus, &stats);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    handles.push(tokio::spawn(publisher.run(shutdown_rx.clone())));

    let mut live_symbols = 0usize;
    for venue in config.venues.clone() {
        // Global cap on live book states.
        let mut venue = venue;
        let budget = config.orderbook.max_live_symbols.saturating_sub(live_symbols);
        if venue.symbols.len() > budget {
            warn!(
                exchange = %venue.exchange,
                dropped = venue.symbols.len() - budget,
                "symbol cap reached, truncating venue symbol list"
            );
            venue.symbols.truncate(budget);
        }
        live_symbols += venue.symbols.len();

        let limiter = Arc::new(VenueLimiter::new(venue.exchange, &venue.rate_limit));
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poller.request_timeout_secs))
            .build()
            .context("http client")?;
        let adapter = make_adapter(&venue, limiter, http);

        let poll_tasks = build_tasks(&config.poller, &venue);
        if !poll_tasks.is_empty() {
            let poller = Arc::new(Poller::new(
                adapter.clone(),
                publisher_handle.clone(),
                config.poller.clone(),
                PollerCounters::new(&stats),
            ));
            for task in poll_tasks {
                handles.push(tokio::spawn(
                    poller.clone().run_task(task, shutdown_rx.clone()),
                ));
            }
        }

        handles.extend(VenueSupervisor::spawn(
            venue,
            adapter,
            config.orderbook.clone(),
            publisher_handle.clone(),
            &stats,
            service_health.clone(),
            degraded.clone(),
            shutdown_rx.clone(),
        ));
    }

    handles.push(tokio::spawn(watchdog(
        config.clone(),
        service_health.clone(),
        stats.clone(),
        degraded.clone(),
        shutdown_rx.clone(),
    )));

    info!(venues = config.venues.len(), "riptide-ingest running");
    wait_for_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    let drain = futures_util::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("drain deadline exceeded, exiting anyway");
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

/// Protocol violations per check interval that degrade the service.
const PROTOCOL_VIOLATION_RATE_LIMIT: u64 = 100;

/// Periodic cross-component health: degraded symbol threshold, protocol
/// violation rate, and a coarse RSS check.
async fn watchdog(
    config: PipelineConfig,
    service_health: Arc<ServiceHealth>,
    stats: Arc<StatsRegistry>,
    degraded: Arc<DegradedSymbols>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut health_tick =
        tokio::time::interval(Duration::from_secs(config.health.check_interval_secs));
    let mut memory_tick =
        tokio::time::interval(Duration::from_secs(config.limits.memory_check_secs));
    let violations = stats.counter("supervisor.protocol_violations");
    let mut violations_seen = violations.get();

    loop {
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = health_tick.tick() => {
                let count = degraded.count();
                stats.set_text("orderbook.degraded_symbols", count.to_string());
                if count >= config.health.degraded_symbol_threshold {
                    service_health.set_check(
                        "orderbook",
                        HealthStatus::Degraded,
                        Some(format!("{count} symbols degraded")),
                    );
                } else {
                    service_health.set_healthy("orderbook");
                }

                let now_violations = violations.get();
                let delta = now_violations - violations_seen;
                violations_seen = now_violations;
                if delta > PROTOCOL_VIOLATION_RATE_LIMIT {
                    service_health.set_check(
                        "protocol",
                        HealthStatus::Degraded,
                        Some(format!("{delta} unparseable frames this interval")),
                    );
                } else {
                    service_health.set_healthy("protocol");
                }
            }
            _ = memory_tick.tick() => {
                if let Some(rss_mb) = resident_set_mb() {
                    stats.set_text("process.rss_mb", rss_mb.to_string());
                    if rss_mb > config.limits.memory_log_rss_mb {
                        warn!(rss_mb, limit = config.limits.memory_log_rss_mb, "RSS above limit");
                    }
                }
            }
        }
    }
}

/// Resident set size in MiB, from /proc on Linux.
fn resident_set_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}
