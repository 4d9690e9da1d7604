//! Order-book worker flow, driven through the real worker loop:
//! channel in, ticker-paced snapshots out, shutdown flush.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};

use config::OrderBookConfig;
use health::StatsRegistry;
use ingest_service::orderbook::{
    BookManager, DegradedSymbols, ManagerCounters, RecordEmit, SnapshotSource,
};
use ingest_service::venue::RawBookDiff;
use ingest_service::Result;
use types::records::MarketRecord;
use types::venue::Exchange;

struct FixedSnapshots(Mutex<Vec<RawBookDiff>>);

#[async_trait]
impl SnapshotSource for FixedSnapshots {
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

fn spawn_manager(
    exchange: Exchange,
    snapshots: Vec<RawBookDiff>,
) -> (
    mpsc::Sender<RawBookDiff>,
    watch::Sender<bool>,
    Arc<Collector>,
    tokio::task::JoinHandle<()>,
) {
    let stats = StatsRegistry::new();
    let sink = Arc::new(Collector::default());
    let mut settings = OrderBookConfig::default();
    settings.resync_backoff_initial_ms = 1;
    settings.resync_backoff_cap_ms = 2;

    let manager = BookManager::new(
        exchange,
        "BTC-USDT".to_string(),
        "BTCUSDT".to_string(),
        settings,
        Arc::new(FixedSnapshots(Mutex::new(snapshots))),
        None,
        sink.clone(),
        DegradedSymbols::new(),
        ManagerCounters::new(&stats),
    );

    let (tx, rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(manager.run(rx, shutdown_rx));
    (tx, shutdown_tx, sink, handle)
}

#[tokio::test(start_paused = true)]
async fn ticker_emits_snapshots_only_while_live() {
    let (tx, shutdown_tx, sink, handle) = spawn_manager(
        Exchange::BinanceSpot,
        vec![snapshot(6, &[(100, 1)], &[(101, 1)])],
    );

    // Nothing is live yet; ticks pass with no output.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(sink.0.lock().is_empty());

    // The join completes and the next tick emits.
    tx.send(diff(5, 7, &[(100, 2)], &[])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    {
        let records = sink.0.lock();
        assert!(!records.is_empty());
        let MarketRecord::OrderBook(book) = &records[0] else {
            panic!("expected orderbook snapshot");
        };
        assert_eq!(book.last_update_id, 7);
        assert!(book.is_well_formed());
    }

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_a_final_snapshot() {
    let (tx, shutdown_tx, sink, handle) = spawn_manager(
        Exchange::BinanceSpot,
        vec![snapshot(6, &[(100, 1)], &[(101, 1)])],
    );

    tx.send(diff(5, 7, &[], &[])).await.unwrap();
    // Advance to let the worker process the diff, then apply one more so
    // the final flush reflects the newest state.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    tx.send(diff(8, 9, &[(99, 3)], &[])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let records = sink.0.lock();
    let last = records.last().expect("final snapshot flushed");
    let MarketRecord::OrderBook(book) = last else {
        panic!("expected orderbook snapshot");
    };
    assert_eq!(book.last_update_id, 9);
}

#[tokio::test(start_paused = true)]
async fn sequence_ids_never_regress_across_a_resync() {
    let (tx, shutdown_tx, sink, handle) = spawn_manager(
        Exchange::OkxSpot,
        Vec::new(),
    );

    // Live on a snapshot, then two chained updates with ticks between.
    tx.send(snapshot(100, &[(100, 1)], &[(101, 1)])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let mut update = diff(101, 101, &[(100, 2)], &[]);
    update.prev_update_id = Some(100);
    tx.send(update).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // Broken chain forces a resync; no output until the next snapshot.
    let mut broken = diff(110, 110, &[], &[]);
    broken.prev_update_id = Some(105);
    tx.send(broken).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    tx.send(snapshot(200, &[(100, 1)], &[(101, 1)])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let records = sink.0.lock();
    let ids: Vec<u64> = records
        .iter()
        .map(|record| match record {
            MarketRecord::OrderBook(book) => book.last_update_id,
            other => panic!("unexpected record: {other:?}"),
        })
        .collect();
    assert!(!ids.is_empty());
    assert!(
        ids.windows(2).all(|pair| pair[0] <= pair[1]),
        "ids regressed: {ids:?}"
    );
}
