//! Per-kind write batching.
//!
//! Each record kind gets its own worker holding one open batch with a
//! `(max_size, max_latency, max_queue)` policy: high-frequency kinds
//! amortize inserts over large batches, low-frequency kinds flush almost
//! immediately so they are queryable without waiting. A flush is one
//! insert request; failures retry with exponential backoff and the batch
//! falls through to the error log when retries run out, so the consumer
//! keeps moving.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use types::venue::DataType;

use crate::error_log::ErrorLog;
use crate::{Result, WriterError};
use config::WriterConfig;
use health::{Counter, StatsRegistry};
use store::{ClickHouseClient, StoreError};

/// Insert target; the hot store in production, a capture in tests.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn insert(&self, table: &str, rows: &[Value]) -> std::result::Result<(), StoreError>;
}

#[async_trait]
impl RowSink for ClickHouseClient {
    async fn insert(&self, table: &str, rows: &[Value]) -> std::result::Result<(), StoreError> {
        self.insert_rows(table, rows).await
    }
}

#[derive(Clone)]
pub struct WriterCounters {
    pub rows_in: Counter,
    pub rows_written: Counter,
    pub batches_flushed: Counter,
    pub write_failures: Counter,
    pub batches_error_logged: Counter,
}

impl WriterCounters {
    pub fn new(stats: &StatsRegistry) -> Self {
        Self {
            rows_in: stats.counter("writer.rows_in"),
            rows_written: stats.counter("writer.rows_written"),
            batches_flushed: stats.counter("writer.batches_flushed"),
            write_failures: stats.counter("writer.write_failures"),
            batches_error_logged: stats.counter("writer.batches_error_logged"),
        }
    }
}

/// Routing front: bounded sender per record kind.
pub struct BatcherSet {
    senders: HashMap<DataType, mpsc::Sender<Value>>,
}

impl BatcherSet {
    /// Push one row toward its batcher. Blocks when that kind's queue is
    /// full, which backpressures the bus consumer.
    pub async fn route(&self, data_type: DataType, row: Value) -> Result<()> {
        let sender = self
            .senders
            .get(&data_type)
            .ok_or(WriterError::ChannelClosed("unknown data type"))?;
        sender
            .send(row)
            .await
            .map_err(|_| WriterError::ChannelClosed(data_type.table()))
    }
}

/// Spawn one batcher worker per record kind.
pub fn spawn_batchers(
    config: &WriterConfig,
    sink: Arc<dyn RowSink>,
    error_log: Arc<ErrorLog>,
    stats: &StatsRegistry,
    shutdown: watch::Receiver<bool>,
) -> (BatcherSet, Vec<JoinHandle<()>>) {
    let counters = WriterCounters::new(stats);
    let mut senders = HashMap::new();
    let mut handles = Vec::new();

    for data_type in DataType::ALL {
        let policy = config.policy(data_type);
        let (tx, rx) = mpsc::channel(policy.max_queue.max(1));
        senders.insert(data_type, tx);

        let batcher = TypedBatcher {
            data_type,
            max_size: policy.max_size.max(1),
            max_latency: Duration::from_secs(policy.max_latency_secs),
            retry_attempts: config.retry_attempts,
            sink: sink.clone(),
            error_log: error_log.clone(),
            counters: counters.clone(),
        };
        handles.push(tokio::spawn(batcher.run(rx, shutdown.clone())));
    }

    (BatcherSet { senders }, handles)
}

struct TypedBatcher {
    data_type: DataType,
    max_size: usize,
    max_latency: Duration,
    retry_attempts: u32,
    sink: Arc<dyn RowSink>,
    error_log: Arc<ErrorLog>,
    counters: WriterCounters,
}

impl TypedBatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Value>, mut shutdown: watch::Receiver<bool>) {
        let mut batch: Vec<Value> = Vec::with_capacity(self.max_size);
        let mut opened_at: Option<Instant> = None;

        loop {
            let deadline = opened_at
                .map(|opened| opened + self.max_latency)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        // One final attempt for whatever is open.
                        while let Ok(row) = rx.try_recv() {
                            batch.push(row);
                        }
                        self.flush(&mut batch).await;
                        return;
                    }
                }

                maybe = rx.recv() => {
                    match maybe {
                        Some(row) => {
                            if batch.is_empty() {
                                opened_at = Some(Instant::now());
                            }
                            self.counters.rows_in.inc();
                            batch.push(row);
                            if batch.len() >= self.max_size {
                                self.flush(&mut batch).await;
                                opened_at = None;
                            }
                        }
                        None => {
                            self.flush(&mut batch).await;
                            return;
                        }
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                        opened_at = None;
                    }
                }
            }
        }
    }

    /// One insert per batch; bounded retries; error log on final failure.
    async fn flush(&mut self, batch: &mut Vec<Value>) {
        if batch.is_empty() {
            return;
        }
        let table = self.data_type.table();
        let mut delay = Duration::from_millis(500);
        let mut last_error: Option<StoreError> = None;

        for attempt in 0..=self.retry_attempts {
            match self.sink.insert(table, batch).await {
                Ok(()) => {
                    debug!(table, rows = batch.len(), "batch written");
                    self.counters.rows_written.add(batch.len() as u64);
                    self.counters.batches_flushed.inc();
                    batch.clear();
                    return;
                }
                Err(e) => {
                    self.counters.write_failures.inc();
                    warn!(table, attempt, error = %e, "batch write failed");
                    last_error = Some(e);
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        // At-least-once with a floor: park the batch and move on.
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.error_log.append(table, &reason, batch);
        self.counters.batches_error_logged.inc();
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockSink {
        inserts: Mutex<Vec<(String, usize)>>,
        failures_remaining: AtomicU32,
    }

    impl MockSink {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                inserts: Mutex::new(Vec::new()),
                failures_remaining: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait]
    impl RowSink for MockSink {
        async fn insert(
            &self,
            table: &str,
            rows: &[Value],
        ) -> std::result::Result<(), StoreError> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Server {
                    status: 500,
                    body: "injected".to_string(),
                });
            }
            self.inserts.lock().push((table.to_string(), rows.len()));
            Ok(())
        }
    }

    fn batcher(
        sink: Arc<MockSink>,
        max_size: usize,
        max_latency: Duration,
        error_log: Arc<ErrorLog>,
    ) -> (TypedBatcher, Arc<StatsRegistry>) {
        let stats = StatsRegistry::new();
        let batcher = TypedBatcher {
            data_type: DataType::Trade,
            max_size,
            max_latency,
            retry_attempts: 2,
            sink,
            error_log,
            counters: WriterCounters::new(&stats),
        };
        (batcher, stats)
    }

    fn temp_log() -> (tempfile::TempDir, Arc<ErrorLog>) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(ErrorLog::new(dir.path().join("errors.jsonl")));
        (dir, log)
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_flushes_full_batches() {
        let sink = MockSink::new(0);
        let (_dir, log) = temp_log();
        let (batcher, stats) = batcher(sink.clone(), 3, Duration::from_secs(10), log);

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(batcher.run(rx, shutdown_rx));

        for i in 0..3 {
            tx.send(json!({"trade_id": i.to_string()})).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.inserts.lock().as_slice(), &[("trades".to_string(), 3)]);
        assert_eq!(stats.counter("writer.rows_written").get(), 3);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn latency_trigger_flushes_partial_batches() {
        let sink = MockSink::new(0);
        let (_dir, log) = temp_log();
        let (batcher, _) = batcher(sink.clone(), 100, Duration::from_secs(10), log);

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(batcher.run(rx, shutdown_rx));

        tx.send(json!({"trade_id": "1"})).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(sink.inserts.lock().as_slice(), &[("trades".to_string(), 1)]);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_error_log_and_advance() {
        let sink = MockSink::new(100);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.jsonl");
        let log = Arc::new(ErrorLog::new(path.clone()));
        let (mut batcher, stats) = batcher(sink.clone(), 10, Duration::from_secs(10), log);

        let mut batch = vec![json!({"trade_id": "1"}), json!({"trade_id": "2"})];
        batcher.flush(&mut batch).await;

        assert!(batch.is_empty(), "batch must advance after final failure");
        assert!(sink.inserts.lock().is_empty());
        assert_eq!(stats.counter("writer.write_failures").get(), 3);
        assert_eq!(stats.counter("writer.batches_error_logged").get(), 1);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("trade_id"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_within_retries() {
        let sink = MockSink::new(1);
        let (_dir, log) = temp_log();
        let (mut batcher, stats) = batcher(sink.clone(), 10, Duration::from_secs(10), log);

        let mut batch = vec![json!({"trade_id": "1"})];
        batcher.flush(&mut batch).await;

        assert_eq!(sink.inserts.lock().len(), 1);
        assert_eq!(stats.counter("writer.batches_error_logged").get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_open_batch_once() {
        let sink = MockSink::new(0);
        let (_dir, log) = temp_log();
        let (batcher, _) = batcher(sink.clone(), 100, Duration::from_secs(60), log);

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(batcher.run(rx, shutdown_rx));

        tx.send(json!({"trade_id": "1"})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        assert_eq!(sink.inserts.lock().as_slice(), &[("trades".to_string(), 1)]);
    }
}
