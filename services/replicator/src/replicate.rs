//! Window replication.
//!
//! Per run, per table (strictly serialized): compute the next window
//! `[watermark, min(watermark + batch, now - safety_margin))`, copy it
//! cold-side with `INSERT ... SELECT ... remote(hot)`, verify counts,
//! advance the watermark. Rerunning a window re-inserts the same rows and
//! the cold table's replacing merge collapses them, so at-least-once is
//! safe end to end.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use types::time::format_millis;

use crate::watermark::WatermarkStore;
use crate::Result;
use config::{ReplicatorConfig, StorageConfig};
use health::{Counter, StatsRegistry};
use store::ClickHouseClient;

/// The next window to replicate, if the table has anything old enough.
pub fn compute_window(
    watermark: DateTime<Utc>,
    now: DateTime<Utc>,
    batch: Duration,
    safety_margin: Duration,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let horizon = now - chrono::Duration::from_std(safety_margin).ok()?;
    let full = watermark + chrono::Duration::from_std(batch).ok()?;
    let end = full.min(horizon);
    if end <= watermark {
        return None;
    }
    Some((watermark, end))
}

fn ts_literal(ts: DateTime<Utc>) -> String {
    format!("toDateTime64('{}', 3, 'UTC')", format_millis(ts))
}

/// The idempotent cross-instance copy statement, executed on the cold
/// instance.
pub fn replicate_sql(
    cold_db: &str,
    hot_native_addr: &str,
    hot_db: &str,
    table: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> String {
    format!(
        "INSERT INTO {cold_db}.{table} SELECT * FROM remote('{hot_native_addr}', {hot_db}.{table}) \
         WHERE timestamp >= {} AND timestamp < {}",
        ts_literal(from),
        ts_literal(to),
    )
}

pub fn count_sql(
    database: &str,
    table: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> String {
    format!(
        "SELECT count() FROM {database}.{table} WHERE timestamp >= {} AND timestamp < {}",
        ts_literal(from),
        ts_literal(to),
    )
}

/// Hot-side cleanup of rows already replicated and past the grace period.
pub fn cleanup_sql(hot_db: &str, table: &str, cutoff: DateTime<Utc>) -> String {
    format!(
        "ALTER TABLE {hot_db}.{table} DELETE WHERE timestamp < {}",
        ts_literal(cutoff),
    )
}

#[derive(Clone)]
pub struct ReplicatorCounters {
    pub windows_replicated: Counter,
    pub window_failures: Counter,
    pub rows_attempted: Counter,
    pub rows_inserted: Counter,
    pub cleanups: Counter,
}

impl ReplicatorCounters {
    pub fn new(stats: &StatsRegistry) -> Self {
        Self {
            windows_replicated: stats.counter("replicator.windows_replicated"),
            window_failures: stats.counter("replicator.window_failures"),
            rows_attempted: stats.counter("replicator.rows_attempted"),
            rows_inserted: stats.counter("replicator.rows_inserted"),
            cleanups: stats.counter("replicator.cleanups"),
        }
    }
}

pub struct Replicator {
    hot: Arc<ClickHouseClient>,
    cold: Arc<ClickHouseClient>,
    hot_native_addr: String,
    config: ReplicatorConfig,
    cold_retention: chrono::Duration,
    watermarks: WatermarkStore,
    counters: ReplicatorCounters,
    stats: Arc<StatsRegistry>,
}

impl Replicator {
    pub fn new(
        hot: Arc<ClickHouseClient>,
        cold: Arc<ClickHouseClient>,
        storage: &StorageConfig,
        config: ReplicatorConfig,
        watermarks: WatermarkStore,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            hot,
            cold,
            hot_native_addr: storage.hot.native_addr.clone(),
            cold_retention: chrono::Duration::days(i64::from(storage.cold_ttl_days)),
            config,
            watermarks,
            counters: ReplicatorCounters::new(&stats),
            stats,
        }
    }

    /// One full pass over the configured tables. Tables run strictly in
    /// sequence; a failed table is skipped (watermark untouched) and the
    /// run continues. Returns the number of tables that failed.
    pub async fn run_once(&mut self) -> usize {
        let started = std::time::Instant::now();
        let tables = self.config.tables.clone();
        let mut failures = 0;
        for table in &tables {
            if let Err(e) = self.replicate_table(table).await {
                self.counters.window_failures.inc();
                failures += 1;
                warn!(table, error = %e, "window replication failed, will retry next run");
            }
        }
        self.stats.set_text(
            "replicator.last_run_ms",
            started.elapsed().as_millis().to_string(),
        );
        failures
    }

    async fn replicate_table(&mut self, table: &str) -> Result<()> {
        let now = types::time::now_millis();
        let default = now - self.cold_retention;
        let watermark = self.watermarks.get(table, default);

        let Some((from, to)) = compute_window(
            watermark,
            now,
            Duration::from_secs(self.config.batch_hours * 3600),
            Duration::from_secs(self.config.safety_margin_secs),
        ) else {
            debug!(table, watermark = %format_millis(watermark), "caught up");
            return Ok(());
        };

        let attempted = self
            .hot
            .count(&count_sql(self.hot.database(), table, from, to))
            .await?;
        self.counters.rows_attempted.add(attempted);

        self.cold
            .execute(&replicate_sql(
                self.cold.database(),
                &self.hot_native_addr,
                self.hot.database(),
                table,
                from,
                to,
            ))
            .await?;

        let inserted = self
            .cold
            .count(&count_sql(self.cold.database(), table, from, to))
            .await?;
        self.counters.rows_inserted.add(inserted);

        // Success: the watermark moves exactly to the window end.
        self.watermarks.advance(table, to)?;
        self.counters.windows_replicated.inc();
        self.stats
            .set_text(&format!("replicator.watermark.{table}"), format_millis(to));
        info!(
            table,
            from = %format_millis(from),
            to = %format_millis(to),
            attempted,
            inserted,
            "window replicated"
        );

        if self.config.cleanup_enabled {
            let grace = chrono::Duration::seconds(self.config.cleanup_grace_hours as i64 * 3600);
            let eligible = now - grace;
            if to <= eligible {
                self.hot
                    .execute(&cleanup_sql(self.hot.database(), table, to))
                    .await?;
                self.counters.cleanups.inc();
                info!(table, cutoff = %format_millis(to), "hot rows cleaned up");
            }
        }
        Ok(())
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    const HOUR_MS: i64 = 3_600_000;

    #[test]
    fn window_advances_by_batch_when_backlogged() {
        let watermark = ts(0);
        let now = ts(100 * HOUR_MS);
        let (from, to) = compute_window(
            watermark,
            now,
            Duration::from_secs(24 * 3600),
            Duration::from_secs(300),
        )
        .unwrap();
        assert_eq!(from, ts(0));
        assert_eq!(to, ts(24 * HOUR_MS));
    }

    #[test]
    fn window_is_clamped_to_the_safety_horizon() {
        let watermark = ts(0);
        let now = ts(2 * HOUR_MS);
        let (_, to) = compute_window(
            watermark,
            now,
            Duration::from_secs(24 * 3600),
            Duration::from_secs(3600),
        )
        .unwrap();
        assert_eq!(to, ts(HOUR_MS));
    }

    #[test]
    fn caught_up_tables_produce_no_window() {
        let now = ts(10 * HOUR_MS);
        let watermark = now - chrono::Duration::seconds(100);
        assert!(compute_window(
            watermark,
            now,
            Duration::from_secs(24 * 3600),
            Duration::from_secs(300),
        )
        .is_none());

        // Watermark exactly at the horizon: empty window, not an error.
        let watermark = now - chrono::Duration::seconds(300);
        assert!(compute_window(
            watermark,
            now,
            Duration::from_secs(24 * 3600),
            Duration::from_secs(300),
        )
        .is_none());
    }

    #[test]
    fn replication_statement_is_windowed_and_remote() {
        let sql = replicate_sql(
            "riptide_cold",
            "10.0.0.5:9000",
            "riptide_hot",
            "trades",
            ts(0),
            ts(24 * HOUR_MS),
        );
        assert!(sql.starts_with("INSERT INTO riptide_cold.trades SELECT * FROM remote("));
        assert!(sql.contains("remote('10.0.0.5:9000', riptide_hot.trades)"));
        assert!(sql.contains("timestamp >= toDateTime64('1970-01-01 00:00:00.000', 3, 'UTC')"));
        assert!(sql.contains("timestamp < toDateTime64('1970-01-02 00:00:00.000', 3, 'UTC')"));
    }

    #[test]
    fn rerunning_a_window_builds_the_identical_statement() {
        let build = || {
            replicate_sql(
                "cold",
                "host:9000",
                "hot",
                "orderbooks",
                ts(HOUR_MS),
                ts(2 * HOUR_MS),
            )
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn cleanup_deletes_strictly_before_the_cutoff() {
        let sql = cleanup_sql("riptide_hot", "trades", ts(HOUR_MS));
        assert_eq!(
            sql,
            "ALTER TABLE riptide_hot.trades DELETE WHERE timestamp < \
             toDateTime64('1970-01-01 01:00:00.000', 3, 'UTC')"
        );
    }
}
