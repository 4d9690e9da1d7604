//! Health and stats surface.
//!
//! Every Riptide service embeds one [`HealthServer`] exposing:
//! - `GET /health`: aggregate status plus named check results
//! - `GET /stats`: monotonic counters and text gauges
//!
//! Components report through shared handles: [`ServiceHealth::set_check`]
//! for health contributions and [`StatsRegistry::counter`] for counters.
//! The server holds no logic of its own; status is the worst reported
//! check at request time.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use dashmap::DashMap;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tracing::{debug, error, info};

/// Service health status levels, worst-wins when aggregating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One named health contribution.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Shared per-service health state.
pub struct ServiceHealth {
    service_name: String,
    started_at: Instant,
    checks: DashMap<String, CheckResult>,
}

impl ServiceHealth {
    pub fn new(service_name: &str) -> Arc<Self> {
        Arc::new(Self {
            service_name: service_name.to_string(),
            started_at: Instant::now(),
            checks: DashMap::new(),
        })
    }

    /// Record a check result, replacing any previous result of that name.
    pub fn set_check(&self, name: &str, status: HealthStatus, detail: Option<String>) {
        self.checks
            .insert(name.to_string(), CheckResult { status, detail });
    }

    /// Shorthand for a passing check.
    pub fn set_healthy(&self, name: &str) {
        self.set_check(name, HealthStatus::Healthy, None);
    }

    /// Remove a check (e.g. a connection that no longer exists).
    pub fn clear_check(&self, name: &str) {
        self.checks.remove(name);
    }

    /// Aggregate status: the worst reported check, healthy when nothing
    /// has reported yet.
    pub fn status(&self) -> HealthStatus {
        self.checks
            .iter()
            .map(|entry| entry.value().status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn snapshot(&self) -> HealthSnapshot {
        let checks: BTreeMap<String, CheckResult> = self
            .checks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        HealthSnapshot {
            service: self.service_name.clone(),
            status: self.status(),
            uptime_seconds: self.uptime_seconds(),
            checks,
        }
    }
}

/// Serialized `/health` body.
#[derive(Debug, Serialize)]
struct HealthSnapshot {
    service: String,
    status: HealthStatus,
    uptime_seconds: u64,
    checks: BTreeMap<String, CheckResult>,
}

/// A monotonic counter handle; cloning shares the underlying value.
#[derive(Clone)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Named counters and text gauges backing `/stats`.
pub struct StatsRegistry {
    counters: DashMap<String, Arc<AtomicU64>>,
    texts: DashMap<String, String>,
}

impl StatsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: DashMap::new(),
            texts: DashMap::new(),
        })
    }

    /// Fetch-or-create a counter by name. Names are dot-separated,
    /// e.g. `publisher.duplicates_dropped`.
    pub fn counter(&self, name: &str) -> Counter {
        let cell = self
            .counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        Counter(cell)
    }

    /// Set a text gauge, e.g. a per-table watermark timestamp.
    pub fn set_text(&self, name: &str, value: String) {
        self.texts.insert(name.to_string(), value);
    }

    /// Stable snapshot of everything the registry holds.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .texts
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        }
    }
}

/// Serialized `/stats` body.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, String>,
}

/// HTTP server exposing `/health` and `/stats`.
pub struct HealthServer {
    health: Arc<ServiceHealth>,
    stats: Arc<StatsRegistry>,
    port: u16,
}

impl HealthServer {
    pub fn new(health: Arc<ServiceHealth>, stats: Arc<StatsRegistry>, port: u16) -> Self {
        Self {
            health,
            stats,
            port,
        }
    }

    /// Run the server until the process exits. Callers spawn this.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let health = Arc::clone(&self.health);
        let stats = Arc::clone(&self.stats);

        let make_svc = make_service_fn(move |_conn| {
            let health = Arc::clone(&health);
            let stats = Arc::clone(&stats);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, Arc::clone(&health), Arc::clone(&stats))
                }))
            }
        });

        info!(%addr, "health server listening");
        let server = Server::bind(&addr).serve(make_svc);
        if let Err(e) = server.await {
            error!(error = %e, "health server terminated");
        }
        Ok(())
    }
}

async fn handle_request(
    req: Request<Body>,
    health: Arc<ServiceHealth>,
    stats: Arc<StatsRegistry>,
) -> Result<Response<Body>, Infallible> {
    debug!(method = %req.method(), path = req.uri().path(), "health request");

    if req.method() != Method::GET {
        return Ok(plain_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }

    match req.uri().path() {
        "/health" => {
            let snapshot = health.snapshot();
            let code = match snapshot.status {
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::OK,
            };
            Ok(json_response(code, &snapshot))
        }
        "/stats" => Ok(json_response(StatusCode::OK, &stats.snapshot())),
        _ => Ok(plain_response(StatusCode::NOT_FOUND, "not found")),
    }
}

fn json_response<T: Serialize>(code: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_string(body) {
        Ok(json) => Response::builder()
            .status(code)
            .header("content-type", "application/json")
            .body(Body::from(json))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(e) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn plain_response(code: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_worst_of_checks() {
        let health = ServiceHealth::new("test");
        assert_eq!(health.status(), HealthStatus::Healthy);

        health.set_healthy("bus");
        health.set_check("venue.okx_spot", HealthStatus::Degraded, None);
        assert_eq!(health.status(), HealthStatus::Degraded);

        health.set_check("store", HealthStatus::Unhealthy, Some("timeout".into()));
        assert_eq!(health.status(), HealthStatus::Unhealthy);

        health.clear_check("store");
        assert_eq!(health.status(), HealthStatus::Degraded);
    }

    #[test]
    fn check_replacement_overwrites() {
        let health = ServiceHealth::new("test");
        health.set_check("venue", HealthStatus::Unhealthy, None);
        health.set_healthy("venue");
        assert_eq!(health.status(), HealthStatus::Healthy);
    }

    #[test]
    fn counters_share_state_across_clones() {
        let stats = StatsRegistry::new();
        let a = stats.counter("messages_in");
        let b = stats.counter("messages_in");
        a.inc();
        b.add(2);
        assert_eq!(stats.counter("messages_in").get(), 3);
    }

    #[test]
    fn snapshot_is_sorted_and_complete() {
        let stats = StatsRegistry::new();
        stats.counter("z.last").inc();
        stats.counter("a.first").add(5);
        stats.set_text("watermark.trades", "2024-01-01 00:00:00.000".into());

        let snapshot = stats.snapshot();
        let keys: Vec<&String> = snapshot.counters.keys().collect();
        assert_eq!(keys, ["a.first", "z.last"]);
        assert_eq!(snapshot.counters["a.first"], 5);
        assert_eq!(
            snapshot.gauges["watermark.trades"],
            "2024-01-01 00:00:00.000"
        );
    }
}
