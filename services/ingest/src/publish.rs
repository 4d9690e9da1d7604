//! Publisher: canonical records onto the bus.
//!
//! Producers hand records to a [`PublisherHandle`]; the publisher worker
//! drains the bounded queue, drops fingerprint duplicates, and publishes
//! with acknowledgement. Delivery is at-least-once: a record survives
//! process boundaries only once the bus acks it, and a record that
//! exhausts its retries is counted and dropped rather than blocking the
//! pipeline.
//!
//! Overload policy is drop-oldest: under sustained backpressure the queue
//! sheds the stalest records first and the drop counter tells the story.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use types::records::MarketRecord;

use crate::dedup::DedupCache;
use crate::orderbook::RecordEmit;
use bus::{BusClient, BusError};
use codec::{encode_record, fingerprint, Envelope};
use config::PublisherConfig;
use health::{Counter, StatsRegistry};

/// Acked publish target; the bus in production, a capture in tests.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn publish(&self, envelope: &Envelope, msg_id: &str) -> Result<(), BusError>;
}

#[async_trait]
impl RecordSink for BusClient {
    async fn publish(&self, envelope: &Envelope, msg_id: &str) -> Result<(), BusError> {
        BusClient::publish(self, envelope, msg_id).await
    }
}

#[derive(Clone)]
pub struct PublisherCounters {
    pub published: Counter,
    pub duplicates_dropped: Counter,
    pub publish_failures: Counter,
    pub queue_dropped: Counter,
    pub batches_flushed: Counter,
}

impl PublisherCounters {
    pub fn new(stats: &StatsRegistry) -> Self {
        Self {
            published: stats.counter("publisher.published"),
            duplicates_dropped: stats.counter("publisher.duplicates_dropped"),
            publish_failures: stats.counter("publisher.publish_failures"),
            queue_dropped: stats.counter("publisher.queue_dropped"),
            batches_flushed: stats.counter("publisher.batches_flushed"),
        }
    }
}

/// Bounded drop-oldest queue feeding the publisher worker.
struct Queue {
    records: Mutex<VecDeque<MarketRecord>>,
    capacity: usize,
    notify: Notify,
    dropped: Counter,
}

impl Queue {
    fn push(&self, record: MarketRecord) {
        {
            let mut records = self.records.lock();
            if records.len() >= self.capacity {
                records.pop_front();
                self.dropped.inc();
            }
            records.push_back(record);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<MarketRecord> {
        self.records.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.records.lock().len()
    }
}

/// Cloneable producer-side handle.
#[derive(Clone)]
pub struct PublisherHandle {
    queue: Arc<Queue>,
}

impl PublisherHandle {
    /// Enqueue without blocking; overload drops the oldest queued record.
    pub fn push(&self, record: MarketRecord) {
        self.queue.push(record);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl RecordEmit for PublisherHandle {
    fn emit(&self, record: MarketRecord) {
        self.push(record);
    }
}

pub struct Publisher {
    config: PublisherConfig,
    queue: Arc<Queue>,
    sink: Arc<dyn RecordSink>,
    dedup: DedupCache,
    counters: PublisherCounters,
}

impl Publisher {
    pub fn new(
        config: PublisherConfig,
        sink: Arc<dyn RecordSink>,
        stats: &StatsRegistry,
    ) -> (Self, PublisherHandle) {
        let counters = PublisherCounters::new(stats);
        let queue = Arc::new(Queue {
            records: Mutex::new(VecDeque::new()),
            capacity: config.queue_capacity,
            notify: Notify::new(),
            dropped: counters.queue_dropped.clone(),
        });
        let dedup = DedupCache::new(
            Duration::from_secs(config.dedup_ttl_secs),
            config.dedup_capacity,
        );
        let handle = PublisherHandle {
            queue: queue.clone(),
        };
        (
            Self {
                config,
                queue,
                sink,
                dedup,
                counters,
            },
            handle,
        )
    }

    /// Worker loop: flush at batch size or linger expiry, drain on
    /// shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let linger = Duration::from_secs(self.config.linger_secs);
        let mut batch: Vec<MarketRecord> = Vec::with_capacity(self.config.batch_size);
        let mut batch_opened_at: Option<Instant> = None;

        loop {
            while batch.len() < self.config.batch_size {
                match self.queue.pop() {
                    Some(record) => {
                        if batch.is_empty() {
                            batch_opened_at = Some(Instant::now());
                        }
                        batch.push(record);
                    }
                    None => break,
                }
            }

            let linger_expired = batch_opened_at
                .map(|opened| opened.elapsed() >= linger)
                .unwrap_or(false);
            if batch.len() >= self.config.batch_size || (!batch.is_empty() && linger_expired) {
                self.flush_batch(&mut batch).await;
                batch_opened_at = None;
                continue;
            }

            let wake_at = batch_opened_at
                .map(|opened| opened + linger)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        while let Some(record) = self.queue.pop() {
                            batch.push(record);
                        }
                        self.flush_batch(&mut batch).await;
                        return;
                    }
                }

                _ = self.queue.notify.notified() => {}

                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Publish every fresh record in the batch, sequentially to preserve
    /// per-source order.
    async fn flush_batch(&mut self, batch: &mut Vec<MarketRecord>) {
        if batch.is_empty() {
            return;
        }
        debug!(size = batch.len(), "flushing publish batch");
        for record in batch.drain(..) {
            let fingerprint = fingerprint(&record);
            if !self.dedup.insert(&fingerprint) {
                self.counters.duplicates_dropped.inc();
                continue;
            }
            let envelope = match encode_record(&record) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "record failed to encode, dropping");
                    self.counters.publish_failures.inc();
                    continue;
                }
            };
            self.publish_with_retry(&envelope, &fingerprint).await;
        }
        self.counters.batches_flushed.inc();
    }

    async fn publish_with_retry(&self, envelope: &Envelope, msg_id: &str) {
        let mut attempt = 0usize;
        loop {
            match self.sink.publish(envelope, msg_id).await {
                Ok(()) => {
                    self.counters.published.inc();
                    return;
                }
                Err(e) => {
                    let Some(backoff) = self.config.retry_backoff_ms.get(attempt) else {
                        warn!(
                            subject = %envelope.subject,
                            error = %e,
                            "publish retries exhausted, dropping record"
                        );
                        self.counters.publish_failures.inc();
                        return;
                    };
                    debug!(subject = %envelope.subject, attempt, error = %e, "publish retry");
                    tokio::time::sleep(Duration::from_millis(*backoff)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use types::records::{Side, Trade};
    use types::venue::{Exchange, MarketType};

    struct MockSink {
        published: Mutex<Vec<Envelope>>,
        fail_first: AtomicUsize,
    }

    impl MockSink {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl RecordSink for MockSink {
        async fn publish(&self, envelope: &Envelope, _msg_id: &str) -> Result<(), BusError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BusError::Publish("injected".to_string()));
            }
            self.published.lock().push(envelope.clone());
            Ok(())
        }
    }

    fn trade(id: &str) -> MarketRecord {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        MarketRecord::Trade(Trade {
            exchange: Exchange::BinanceSpot,
            market_type: MarketType::Spot,
            symbol: "BTC-USDT".to_string(),
            trade_id: id.to_string(),
            price: dec!(100),
            quantity: dec!(1),
            side: Side::Buy,
            is_maker: None,
            timestamp: ts,
            collected_at: ts,
        })
    }

    fn publisher(sink: Arc<MockSink>) -> (Publisher, PublisherHandle, Arc<StatsRegistry>) {
        let stats = StatsRegistry::new();
        let mut config = PublisherConfig::default();
        config.retry_backoff_ms = vec![1, 1, 1];
        let (publisher, handle) = Publisher::new(config, sink, &stats);
        (publisher, handle, stats)
    }

    #[tokio::test]
    async fn duplicate_records_are_published_once() {
        let sink = MockSink::new(0);
        let (mut publisher, _, stats) = publisher(sink.clone());

        let mut batch = vec![trade("42"), trade("42")];
        publisher.flush_batch(&mut batch).await;

        assert_eq!(sink.published.lock().len(), 1);
        assert_eq!(stats.counter("publisher.duplicates_dropped").get(), 1);
        assert_eq!(stats.counter("publisher.published").get(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sink = MockSink::new(2);
        let (mut publisher, _, stats) = publisher(sink.clone());

        let mut batch = vec![trade("1")];
        publisher.flush_batch(&mut batch).await;

        assert_eq!(sink.published.lock().len(), 1);
        assert_eq!(stats.counter("publisher.publish_failures").get(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_drop_and_count() {
        let sink = MockSink::new(100);
        let (mut publisher, _, stats) = publisher(sink.clone());

        let mut batch = vec![trade("1")];
        publisher.flush_batch(&mut batch).await;

        assert!(sink.published.lock().is_empty());
        assert_eq!(stats.counter("publisher.publish_failures").get(), 1);
        // The failed record does not block later ones.
        sink.fail_first.store(0, Ordering::SeqCst);
        let mut batch = vec![trade("2")];
        publisher.flush_batch(&mut batch).await;
        assert_eq!(sink.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn queue_overflow_drops_oldest() {
        let sink = MockSink::new(0);
        let stats = StatsRegistry::new();
        let mut config = PublisherConfig::default();
        config.queue_capacity = 3;
        let (publisher, handle) = Publisher::new(config, sink, &stats);

        for i in 0..5 {
            handle.push(trade(&i.to_string()));
        }
        assert_eq!(handle.pending(), 3);
        assert_eq!(stats.counter("publisher.queue_dropped").get(), 2);

        // Oldest were shed: the queue holds trades 2, 3, 4.
        let first = publisher.queue.pop().unwrap();
        let MarketRecord::Trade(first) = first else {
            panic!("expected trade");
        };
        assert_eq!(first.trade_id, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn linger_flushes_partial_batches() {
        let sink = MockSink::new(0);
        let (publisher, handle, stats) = publisher(sink.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(publisher.run(shutdown_rx));

        handle.push(trade("1"));
        handle.push(trade("2"));

        // Under the batch size, so only the linger timer can flush.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sink.published.lock().len(), 2);
        assert_eq!(stats.counter("publisher.batches_flushed").get(), 1);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_the_queue() {
        let sink = MockSink::new(0);
        let (publisher, handle, _) = publisher(sink.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        handle.push(trade("1"));
        handle.push(trade("2"));
        shutdown_tx.send(true).unwrap();

        publisher.run(shutdown_rx).await;
        assert_eq!(sink.published.lock().len(), 2);
    }
}
