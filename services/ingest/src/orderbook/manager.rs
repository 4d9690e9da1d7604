//! Per-symbol order-book state machine.
//!
//! One manager owns one (exchange, symbol) book and runs as a single
//! worker: diffs arrive on a bounded channel, the snapshot ticker runs in
//! the same task, so the book is never touched from two places.
//!
//! ```text
//! Initializing -> Syncing -> Live -> Resyncing -> Syncing -> ...
//! ```
//!
//! Binance-family books sync by joining a REST snapshot against buffered
//! diffs; OKX-family books sync from the in-band snapshot that heads every
//! subscription, with resync implemented as a depth re-subscription.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use types::records::MarketRecord;
use types::venue::Exchange;

use super::book::LocalBook;
use super::checksum::okx_checksum;
use crate::connection::Backoff;
use crate::error::Result;
use crate::normalize;
use crate::venue::RawBookDiff;
use config::OrderBookConfig;
use health::{Counter, StatsRegistry};

/// Book lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookState {
    Initializing,
    Syncing,
    Live,
    Resyncing,
}

/// How this venue family recovers book state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// REST snapshot joined against buffered diffs (Binance).
    RestJoin,
    /// Full snapshot arrives in-band; resync is a re-subscription (OKX).
    StreamSnapshot,
}

impl SyncMode {
    pub fn for_exchange(exchange: Exchange) -> SyncMode {
        if exchange.is_okx() {
            SyncMode::StreamSnapshot
        } else {
            SyncMode::RestJoin
        }
    }
}

/// Source of REST depth snapshots; implemented by venue adapters and by
/// test fixtures.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, venue_symbol: &str) -> Result<RawBookDiff>;
}

/// Where finished snapshots go; implemented by the publisher handle and by
/// test collectors.
pub trait RecordEmit: Send + Sync {
    fn emit(&self, record: MarketRecord);
}

/// Symbols currently marked degraded, shared with the health surface.
#[derive(Default)]
pub struct DegradedSymbols(DashMap<String, ()>);

impl DegradedSymbols {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn mark(&self, key: String) {
        self.0.insert(key, ());
    }

    fn clear(&self, key: &str) {
        self.0.remove(key);
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }
}

/// Shared engine counters, one set per service.
#[derive(Clone)]
pub struct ManagerCounters {
    pub snapshots_emitted: Counter,
    pub resyncs: Counter,
    pub sequence_gaps: Counter,
    pub checksum_failures: Counter,
    pub stale_dropped: Counter,
}

impl ManagerCounters {
    pub fn new(stats: &StatsRegistry) -> Self {
        Self {
            snapshots_emitted: stats.counter("orderbook.snapshots_emitted"),
            resyncs: stats.counter("orderbook.resyncs"),
            sequence_gaps: stats.counter("orderbook.sequence_gaps"),
            checksum_failures: stats.counter("orderbook.checksum_failures"),
            stale_dropped: stats.counter("orderbook.stale_dropped"),
        }
    }
}

pub struct BookManager {
    exchange: Exchange,
    canonical_symbol: String,
    venue_symbol: String,
    settings: OrderBookConfig,
    mode: SyncMode,

    state: BookState,
    book: LocalBook,
    last_applied: u64,
    last_emitted_id: u64,
    last_event_ms: Option<i64>,
    buffer: VecDeque<RawBookDiff>,
    pending_snapshot: Option<RawBookDiff>,
    checksum_failures: u32,
    consecutive_resyncs: u32,
    resync_backoff: Backoff,
    last_diff_at: Instant,

    snapshot_source: Arc<dyn SnapshotSource>,
    /// OKX resync path: ask the supervisor to cycle the depth channel.
    resubscribe_tx: Option<mpsc::Sender<String>>,
    sink: Arc<dyn RecordEmit>,
    degraded: Arc<DegradedSymbols>,
    counters: ManagerCounters,
}

impl BookManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Exchange,
        canonical_symbol: String,
        venue_symbol: String,
        settings: OrderBookConfig,
        snapshot_source: Arc<dyn SnapshotSource>,
        resubscribe_tx: Option<mpsc::Sender<String>>,
        sink: Arc<dyn RecordEmit>,
        degraded: Arc<DegradedSymbols>,
        counters: ManagerCounters,
    ) -> Self {
        let collection_depth = settings.collection_depth;
        let backoff = Backoff::new(
            Duration::from_millis(settings.resync_backoff_initial_ms),
            Duration::from_millis(settings.resync_backoff_cap_ms),
        );
        Self {
            mode: SyncMode::for_exchange(exchange),
            exchange,
            canonical_symbol,
            venue_symbol,
            settings,
            state: BookState::Initializing,
            book: LocalBook::new(collection_depth),
            last_applied: 0,
            last_emitted_id: 0,
            last_event_ms: None,
            buffer: VecDeque::new(),
            pending_snapshot: None,
            checksum_failures: 0,
            consecutive_resyncs: 0,
            resync_backoff: backoff,
            last_diff_at: Instant::now(),
            snapshot_source,
            resubscribe_tx,
            sink,
            degraded,
            counters,
        }
    }

    fn key(&self) -> String {
        format!("{}:{}", self.exchange, self.canonical_symbol)
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Worker loop: diffs, snapshot ticks, idle eviction, shutdown.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<RawBookDiff>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.settings.snapshot_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut idle_check = tokio::time::interval(Duration::from_secs(60));
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        // Flush the book one last time so consumers see the
                        // final state.
                        self.emit_snapshot();
                        break;
                    }
                }

                maybe = rx.recv() => {
                    match maybe {
                        Some(diff) => self.on_message(diff).await,
                        None => break,
                    }
                }

                _ = ticker.tick() => {
                    self.emit_snapshot();
                }

                _ = idle_check.tick() => {
                    if self.last_diff_at.elapsed()
                        > Duration::from_secs(self.settings.idle_eviction_secs)
                    {
                        info!(key = %self.key(), "book idle, evicting state");
                        break;
                    }
                }
            }
        }
        self.degraded.clear(&self.key());
    }

    /// Process one depth message.
    pub async fn on_message(&mut self, diff: RawBookDiff) {
        self.last_diff_at = Instant::now();
        match self.mode {
            SyncMode::StreamSnapshot => self.on_message_stream(diff).await,
            SyncMode::RestJoin => self.on_message_rest(diff).await,
        }
    }

    // ---- OKX-family path -------------------------------------------------

    async fn on_message_stream(&mut self, diff: RawBookDiff) {
        if diff.is_snapshot {
            self.install_stream_snapshot(diff);
            return;
        }
        match self.state {
            BookState::Live => self.apply_stream_update(diff).await,
            // While (re)syncing, only a snapshot is actionable.
            _ => {
                if self.state == BookState::Initializing {
                    // A subscription that starts mid-stream has lost its
                    // snapshot; ask for a fresh one.
                    self.state = BookState::Syncing;
                    self.request_resubscribe().await;
                }
            }
        }
    }

    fn install_stream_snapshot(&mut self, snapshot: RawBookDiff) {
        self.book.replace(&snapshot.bids, &snapshot.asks);
        self.last_applied = snapshot.last_update_id;
        self.last_event_ms = snapshot.event_time_ms;
        self.checksum_failures = 0;

        if let Some(expected) = snapshot.checksum {
            if okx_checksum(&self.book) != expected {
                // A snapshot that fails its own checksum is unusable.
                self.counters.checksum_failures.inc();
                warn!(key = %self.key(), "snapshot failed checksum");
                self.book.clear();
                self.state = BookState::Syncing;
                return;
            }
        }

        self.mark_live();
    }

    async fn apply_stream_update(&mut self, diff: RawBookDiff) {
        if diff.prev_update_id != Some(self.last_applied) {
            self.counters.sequence_gaps.inc();
            self.start_resync("sequence chain broken").await;
            return;
        }

        self.book.apply(&diff.bids, &diff.asks);
        self.last_applied = diff.last_update_id;
        self.last_event_ms = diff.event_time_ms;

        if self.book.is_crossed() {
            self.start_resync("book crossed").await;
            return;
        }

        if let Some(expected) = diff.checksum {
            if okx_checksum(&self.book) == expected {
                self.checksum_failures = 0;
            } else {
                self.checksum_failures += 1;
                self.counters.checksum_failures.inc();
                debug!(
                    key = %self.key(),
                    consecutive = self.checksum_failures,
                    "checksum mismatch"
                );
                if self.checksum_failures >= self.settings.checksum_failure_threshold {
                    self.start_resync("checksum mismatches").await;
                }
            }
        }
    }

    // ---- Binance-family path ---------------------------------------------

    async fn on_message_rest(&mut self, diff: RawBookDiff) {
        match self.state {
            BookState::Initializing => {
                self.buffer.push_back(diff);
                self.state = BookState::Syncing;
                self.sync_from_rest().await;
            }
            BookState::Syncing | BookState::Resyncing => {
                self.buffer.push_back(diff);
                if self.pending_snapshot.is_some() {
                    self.try_join();
                } else {
                    self.sync_from_rest().await;
                }
            }
            BookState::Live => self.apply_rest_update(diff).await,
        }
    }

    /// Fetch a snapshot and attempt the join. On fetch failure the manager
    /// stays in Syncing; the next diff retries after backoff.
    async fn sync_from_rest(&mut self) {
        match self.snapshot_source.fetch_snapshot(&self.venue_symbol).await {
            Ok(snapshot) => {
                self.pending_snapshot = Some(snapshot);
                self.resync_backoff.reset();
                self.try_join();
            }
            Err(e) => {
                let delay = self.resync_backoff.next_delay();
                warn!(key = %self.key(), error = %e, ?delay, "snapshot fetch failed");
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// The Binance join rule: drop buffered diffs entirely behind the
    /// snapshot; the first survivor must straddle `snapshot_id + 1`.
    fn try_join(&mut self) {
        let Some(snapshot) = self.pending_snapshot.as_ref() else {
            return;
        };
        let snapshot_id = snapshot.last_update_id;

        while let Some(first) = self.buffer.front() {
            if first.last_update_id <= snapshot_id {
                self.buffer.pop_front();
                continue;
            }
            if first.first_update_id > snapshot_id + 1 {
                // Snapshot is already stale; fetch a newer one on the next
                // message.
                debug!(key = %self.key(), snapshot_id, "snapshot stale, refetching");
                self.pending_snapshot = None;
                return;
            }
            break;
        }

        let Some(first) = self.buffer.front() else {
            // Nothing usable buffered yet; keep waiting for diffs.
            return;
        };
        debug_assert!(
            first.first_update_id <= snapshot_id + 1 && first.last_update_id > snapshot_id
        );

        let snapshot = self.pending_snapshot.take().expect("checked above");
        self.book.replace(&snapshot.bids, &snapshot.asks);
        self.last_applied = snapshot_id;
        self.last_event_ms = snapshot.event_time_ms;

        let mut first_applied = false;
        while let Some(diff) = self.buffer.pop_front() {
            // The join straddle covers the first diff only; everything
            // after must chain.
            if first_applied {
                let contiguous = match diff.prev_update_id {
                    Some(prev) => prev == self.last_applied,
                    None => diff.first_update_id <= self.last_applied + 1,
                };
                if !contiguous {
                    self.counters.sequence_gaps.inc();
                    self.book.clear();
                    self.buffer.clear();
                    self.state = BookState::Syncing;
                    return;
                }
            }
            self.book.apply(&diff.bids, &diff.asks);
            self.last_applied = diff.last_update_id;
            self.last_event_ms = diff.event_time_ms;
            first_applied = true;
        }

        if self.book.is_crossed() {
            self.book.clear();
            self.state = BookState::Syncing;
            return;
        }

        self.mark_live();
    }

    async fn apply_rest_update(&mut self, diff: RawBookDiff) {
        // Replays (rotation overlap, venue retransmits) are dropped, not
        // errors.
        if diff.last_update_id <= self.last_applied {
            self.counters.stale_dropped.inc();
            return;
        }

        let contiguous = match diff.prev_update_id {
            // Derivatives chain: pu must equal the previous u.
            Some(prev) => prev == self.last_applied,
            // Spot: U must not skip past last_applied + 1.
            None => diff.first_update_id <= self.last_applied + 1,
        };
        if !contiguous {
            self.counters.sequence_gaps.inc();
            self.start_resync("sequence gap").await;
            return;
        }

        self.book.apply(&diff.bids, &diff.asks);
        self.last_applied = diff.last_update_id;
        self.last_event_ms = diff.event_time_ms;

        if self.book.is_crossed() {
            self.start_resync("book crossed").await;
        }
    }

    // ---- Shared transitions ----------------------------------------------

    fn mark_live(&mut self) {
        self.state = BookState::Live;
        self.resync_backoff.reset();
        // The consecutive-resync count survives until the book proves
        // stable through a snapshot tick; a symbol that flaps between
        // Live and Resyncing is still degraded.
        info!(key = %self.key(), last_update_id = self.last_applied, "book live");
    }

    async fn start_resync(&mut self, reason: &str) {
        self.counters.resyncs.inc();
        self.consecutive_resyncs += 1;
        warn!(
            key = %self.key(),
            reason,
            attempt = self.consecutive_resyncs,
            "book resync"
        );

        self.state = BookState::Resyncing;
        self.book.clear();
        self.buffer.clear();
        self.pending_snapshot = None;
        self.checksum_failures = 0;

        if self.consecutive_resyncs >= self.settings.max_consecutive_resyncs {
            // Keep retrying, but surface the symbol as degraded.
            self.degraded.mark(self.key());
        }

        let delay = self.resync_backoff.next_delay();
        tokio::time::sleep(delay).await;
        self.state = BookState::Syncing;
        self.request_resubscribe().await;
    }

    async fn request_resubscribe(&mut self) {
        if self.mode == SyncMode::StreamSnapshot {
            if let Some(tx) = &self.resubscribe_tx {
                let _ = tx.send(self.canonical_symbol.clone()).await;
            }
        }
    }

    /// Publish the top-N view; a function of book state at tick time.
    fn emit_snapshot(&mut self) {
        if self.state != BookState::Live || self.book.is_empty() {
            return;
        }
        // Sequence identity must never move backwards on the bus.
        if self.last_applied < self.last_emitted_id {
            warn!(key = %self.key(), "suppressing snapshot with regressed update id");
            return;
        }
        let record = normalize::book_snapshot(
            self.exchange,
            &self.canonical_symbol,
            &self.book,
            self.settings.publish_depth,
            self.last_applied,
            self.last_event_ms,
        );
        self.last_emitted_id = self.last_applied;
        self.consecutive_resyncs = 0;
        self.degraded.clear(&self.key());
        self.counters.snapshots_emitted.inc();
        self.sink.emit(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use types::records::MarketRecord;

    struct FixedSnapshot(Mutex<Vec<RawBookDiff>>);

    #[async_trait]
    impl SnapshotSource for FixedSnapshot {
        async fn fetch_snapshot(&self, _venue_symbol: &str) -> Result<RawBookDiff> {
            Ok(self.0.lock().remove(0))
        }
    }

    #[derive(Default)]
    struct Collector(Mutex<Vec<MarketRecord>>);

    impl RecordEmit for Collector {
        fn emit(&self, record: MarketRecord) {
            self.0.lock().push(record);
        }
    }

    fn levels(pairs: &[(i64, i64)]) -> Vec<(Decimal, Decimal)> {
        pairs
            .iter()
            .map(|&(p, q)| (Decimal::from(p), Decimal::from(q)))
            .collect()
    }

    fn diff(first: u64, last: u64, bids: &[(i64, i64)], asks: &[(i64, i64)]) -> RawBookDiff {
        RawBookDiff {
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            last_update_id: last,
            prev_update_id: None,
            is_snapshot: false,
            bids: levels(bids),
            asks: levels(asks),
            checksum: None,
            event_time_ms: Some(1_700_000_000_000),
        }
    }

    fn snapshot(id: u64, bids: &[(i64, i64)], asks: &[(i64, i64)]) -> RawBookDiff {
        RawBookDiff {
            is_snapshot: true,
            ..diff(id, id, bids, asks)
        }
    }

    fn okx_update(seq: u64, prev: u64, bids: &[(i64, i64)], asks: &[(i64, i64)]) -> RawBookDiff {
        RawBookDiff {
            prev_update_id: Some(prev),
            ..diff(seq, seq, bids, asks)
        }
    }

    fn manager(
        exchange: Exchange,
        snapshots: Vec<RawBookDiff>,
    ) -> (BookManager, Arc<Collector>, Arc<DegradedSymbols>) {
        let stats = StatsRegistry::new();
        let sink = Arc::new(Collector::default());
        let degraded = DegradedSymbols::new();
        let mut settings = OrderBookConfig::default();
        settings.resync_backoff_initial_ms = 1;
        settings.resync_backoff_cap_ms = 2;
        let manager = BookManager::new(
            exchange,
            "BTC-USDT".to_string(),
            "BTCUSDT".to_string(),
            settings,
            Arc::new(FixedSnapshot(Mutex::new(snapshots))),
            None,
            sink.clone(),
            degraded.clone(),
            ManagerCounters::new(&stats),
        );
        (manager, sink, degraded)
    }

    #[tokio::test]
    async fn binance_join_point_accepts_straddling_diff() {
        // Snapshot lastUpdateId = 6; first usable diff is (5,7).
        let (mut manager, sink, _) =
            manager(Exchange::BinanceSpot, vec![snapshot(6, &[(100, 1)], &[(101, 1)])]);

        manager.on_message(diff(5, 7, &[(100, 2)], &[])).await;
        assert_eq!(manager.state(), BookState::Live);
        assert_eq!(manager.last_applied(), 7);

        manager.on_message(diff(8, 10, &[(99, 1)], &[])).await;
        assert_eq!(manager.state(), BookState::Live);
        assert_eq!(manager.last_applied(), 10);

        manager.on_message(diff(11, 12, &[], &[(102, 1)])).await;
        assert_eq!(manager.last_applied(), 12);

        manager.emit_snapshot();
        let records = sink.0.lock();
        let MarketRecord::OrderBook(book) = &records[0] else {
            panic!("expected orderbook snapshot");
        };
        assert_eq!(book.last_update_id, 12);
        assert!(book.is_well_formed());
    }

    #[tokio::test]
    async fn binance_gap_triggers_resync() {
        let (mut manager, _, _) = manager(
            Exchange::BinanceSpot,
            vec![
                snapshot(6, &[(100, 1)], &[(101, 1)]),
                snapshot(40, &[(100, 1)], &[(101, 1)]),
            ],
        );

        manager.on_message(diff(5, 7, &[], &[])).await;
        manager.on_message(diff(8, 10, &[], &[])).await;
        assert_eq!(manager.state(), BookState::Live);

        // U jumps past last_applied + 1.
        manager.on_message(diff(12, 13, &[], &[])).await;
        assert_ne!(manager.state(), BookState::Live);

        // Recovery: fresh snapshot joins against a new straddling diff.
        manager.on_message(diff(39, 41, &[(100, 2)], &[])).await;
        assert_eq!(manager.state(), BookState::Live);
        assert_eq!(manager.last_applied(), 41);
    }

    #[tokio::test]
    async fn binance_drops_buffered_diffs_behind_snapshot() {
        let (mut manager, _, _) =
            manager(Exchange::BinanceSpot, vec![snapshot(20, &[(100, 1)], &[(101, 1)])]);

        // Entirely behind the snapshot: dropped during the join.
        manager.on_message(diff(10, 15, &[(1, 1)], &[])).await;
        assert_ne!(manager.state(), BookState::Live);

        manager.on_message(diff(19, 22, &[(100, 3)], &[])).await;
        assert_eq!(manager.state(), BookState::Live);
        assert_eq!(manager.last_applied(), 22);
    }

    #[tokio::test]
    async fn binance_stale_diffs_are_dropped_in_live() {
        let (mut manager, _, _) =
            manager(Exchange::BinanceSpot, vec![snapshot(6, &[(100, 1)], &[(101, 1)])]);
        manager.on_message(diff(5, 7, &[], &[])).await;
        assert_eq!(manager.state(), BookState::Live);

        // A replayed diff must not resync or regress.
        manager.on_message(diff(5, 7, &[(100, 9)], &[])).await;
        assert_eq!(manager.state(), BookState::Live);
        assert_eq!(manager.last_applied(), 7);
    }

    #[tokio::test]
    async fn derivatives_pu_chain_is_enforced() {
        let (mut manager, _, _) = manager(
            Exchange::BinanceDerivatives,
            vec![
                snapshot(100, &[(100, 1)], &[(101, 1)]),
                snapshot(300, &[(100, 1)], &[(101, 1)]),
            ],
        );

        let mut first = diff(99, 105, &[], &[]);
        first.prev_update_id = Some(90);
        manager.on_message(first).await;
        assert_eq!(manager.state(), BookState::Live);

        let mut chained = diff(106, 110, &[], &[]);
        chained.prev_update_id = Some(105);
        manager.on_message(chained).await;
        assert_eq!(manager.last_applied(), 110);

        let mut broken = diff(111, 115, &[], &[]);
        broken.prev_update_id = Some(112);
        manager.on_message(broken).await;
        assert_ne!(manager.state(), BookState::Live);
    }

    #[tokio::test]
    async fn okx_syncs_from_stream_snapshot() {
        let (mut manager, sink, _) = manager(Exchange::OkxSpot, vec![]);

        let mut snap = snapshot(100, &[(100, 1), (99, 2)], &[(101, 1)]);
        snap.symbol = "BTC-USDT".to_string();
        manager.on_message(snap).await;
        assert_eq!(manager.state(), BookState::Live);

        manager
            .on_message(okx_update(101, 100, &[(100, 3)], &[]))
            .await;
        assert_eq!(manager.last_applied(), 101);

        manager.emit_snapshot();
        let records = sink.0.lock();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn okx_broken_chain_resyncs_until_next_snapshot() {
        let (mut manager, sink, _) = manager(Exchange::OkxSpot, vec![]);
        manager.on_message(snapshot(100, &[(100, 1)], &[(101, 1)])).await;
        assert_eq!(manager.state(), BookState::Live);

        // prevSeqId does not chain.
        manager.on_message(okx_update(105, 103, &[], &[])).await;
        assert_ne!(manager.state(), BookState::Live);

        // No emission while out of sync.
        manager.emit_snapshot();
        assert!(sink.0.lock().is_empty());

        // The re-subscription snapshot restores Live.
        manager.on_message(snapshot(200, &[(100, 1)], &[(101, 1)])).await;
        assert_eq!(manager.state(), BookState::Live);
        assert_eq!(manager.last_applied(), 200);
    }

    #[tokio::test]
    async fn okx_checksum_failures_trigger_resync_after_threshold() {
        let (mut manager, _, _) = manager(Exchange::OkxSpot, vec![]);
        manager.on_message(snapshot(1, &[(100, 1)], &[(101, 1)])).await;
        assert_eq!(manager.state(), BookState::Live);

        // Three consecutive bad checksums (threshold default 3).
        for seq in 2..=4 {
            let mut update = okx_update(seq, seq - 1, &[(100, 1)], &[]);
            update.checksum = Some(1); // wrong on purpose
            manager.on_message(update).await;
        }
        assert_ne!(manager.state(), BookState::Live);
    }

    #[tokio::test]
    async fn okx_matching_checksum_resets_the_failure_count() {
        let (mut manager, _, _) = manager(Exchange::OkxSpot, vec![]);
        manager.on_message(snapshot(1, &[(100, 1)], &[(101, 1)])).await;

        let mut bad = okx_update(2, 1, &[(100, 2)], &[]);
        bad.checksum = Some(1);
        manager.on_message(bad).await;
        assert_eq!(manager.state(), BookState::Live);

        // A correct checksum clears the streak: compute the real value.
        let mut book = LocalBook::new(400);
        book.replace(&levels(&[(100, 3)]), &levels(&[(101, 1)]));
        let mut good = okx_update(3, 2, &[(100, 3)], &[]);
        good.checksum = Some(okx_checksum(&book));
        manager.on_message(good).await;
        assert_eq!(manager.state(), BookState::Live);

        let mut bad = okx_update(4, 3, &[], &[]);
        bad.checksum = Some(1);
        manager.on_message(bad).await;
        let mut bad = okx_update(5, 4, &[], &[]);
        bad.checksum = Some(1);
        manager.on_message(bad).await;
        // Only two consecutive failures; still live.
        assert_eq!(manager.state(), BookState::Live);
    }

    #[tokio::test]
    async fn crossed_book_is_never_published() {
        let (mut manager, sink, _) = manager(Exchange::OkxSpot, vec![]);
        manager.on_message(snapshot(1, &[(100, 1)], &[(101, 1)])).await;

        // A bid through the ask crosses the book.
        manager.on_message(okx_update(2, 1, &[(102, 1)], &[])).await;
        assert_ne!(manager.state(), BookState::Live);
        manager.emit_snapshot();
        assert!(sink.0.lock().is_empty());
    }

    #[tokio::test]
    async fn repeated_resyncs_mark_the_symbol_degraded() {
        let (mut manager, _, degraded) = manager(Exchange::OkxSpot, vec![]);
        for round in 0..5u64 {
            let base = round * 10 + 1;
            manager
                .on_message(snapshot(base, &[(100, 1)], &[(101, 1)]))
                .await;
            assert_eq!(manager.state(), BookState::Live);
            // Break the chain every time.
            manager.on_message(okx_update(base + 5, base + 3, &[], &[])).await;
        }
        assert_eq!(degraded.count(), 1);

        // The flag clears once the book holds Live through a tick.
        manager.on_message(snapshot(1000, &[(100, 1)], &[(101, 1)])).await;
        manager.emit_snapshot();
        assert_eq!(degraded.count(), 0);
    }

    #[tokio::test]
    async fn emitted_ids_are_monotonic() {
        let (mut manager, sink, _) =
            manager(Exchange::BinanceSpot, vec![snapshot(6, &[(100, 1)], &[(101, 1)])]);
        manager.on_message(diff(5, 7, &[], &[])).await;
        manager.emit_snapshot();
        manager.on_message(diff(8, 9, &[], &[])).await;
        manager.emit_snapshot();

        let records = sink.0.lock();
        let ids: Vec<u64> = records
            .iter()
            .map(|r| match r {
                MarketRecord::OrderBook(b) => b.last_update_id,
                _ => panic!("expected orderbook"),
            })
            .collect();
        assert_eq!(ids, vec![7, 9]);
        assert!(ids.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn snapshot_depth_respects_publish_depth() {
        let (mut manager, sink, _) = manager(Exchange::OkxSpot, vec![]);
        let deep: Vec<(i64, i64)> = (0..50).map(|i| (1000 - i, 1)).collect();
        manager.on_message(snapshot(1, &deep, &[(2000, 1)])).await;
        manager.emit_snapshot();

        let records = sink.0.lock();
        let MarketRecord::OrderBook(book) = &records[0] else {
            panic!("expected orderbook");
        };
        assert_eq!(book.bids.len(), OrderBookConfig::default().publish_depth);
        assert!(book.is_well_formed());
    }
}
