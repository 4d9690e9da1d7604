//! Ingestion supervisor.
//!
//! Owns the WebSocket lifecycle for one venue: connect with deadline,
//! subscribe, read, police the heartbeat, reconnect with capped backoff,
//! and rotate proactively ahead of the venue's 24-hour cutoff. Decoded
//! book events fan out to per-symbol managers over bounded channels
//! (blocking send is the backpressure path); everything else goes through
//! the normalizer straight to the publisher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use types::symbol::{concat_form, okx_inst_id};
use types::venue::{DataType, Exchange};

use crate::connection::{jittered, Backoff, WsConnection};
use crate::error::{IngestError, Result};
use crate::normalize;
use crate::orderbook::{BookManager, DegradedSymbols, ManagerCounters, SnapshotSource};
use crate::publish::PublisherHandle;
use crate::rotation::{RecentIds, RotationState};
use crate::venue::{RawBookDiff, VenueAdapter, VenueEvent};
use config::{OrderBookConfig, VenueConfig};
use health::{Counter, HealthStatus, ServiceHealth, StatsRegistry};

/// Why a connection phase ended.
enum ConnectionEnd {
    Shutdown,
    /// A rotation attempt finished (completed or aborted); the read loop
    /// continues on whichever connection survived.
    Rotating,
}

#[derive(Clone)]
pub struct SupervisorCounters {
    pub messages_received: Counter,
    pub protocol_violations: Counter,
    pub reconnects: Counter,
    pub rotations: Counter,
    pub rotation_aborts: Counter,
}

impl SupervisorCounters {
    pub fn new(stats: &StatsRegistry) -> Self {
        Self {
            messages_received: stats.counter("supervisor.messages_received"),
            protocol_violations: stats.counter("supervisor.protocol_violations"),
            reconnects: stats.counter("supervisor.reconnects"),
            rotations: stats.counter("supervisor.rotations"),
            rotation_aborts: stats.counter("supervisor.rotation_aborts"),
        }
    }
}

/// Adapter-backed snapshot source handed to Binance-family managers.
struct AdapterSnapshots(Arc<dyn VenueAdapter>);

#[async_trait]
impl SnapshotSource for AdapterSnapshots {
    async fn fetch_snapshot(&self, venue_symbol: &str) -> Result<RawBookDiff> {
        self.0.fetch_book_snapshot(venue_symbol).await
    }
}

pub struct VenueSupervisor {
    venue: VenueConfig,
    adapter: Arc<dyn VenueAdapter>,
    publisher: PublisherHandle,
    /// Depth routing keyed by the symbol exactly as the venue spells it in
    /// stream messages.
    book_channels: HashMap<String, mpsc::Sender<RawBookDiff>>,
    resubscribe_rx: mpsc::Receiver<String>,
    backoff: Backoff,
    counters: SupervisorCounters,
    health: Arc<ServiceHealth>,
    shutdown: watch::Receiver<bool>,
}

impl VenueSupervisor {
    /// Spawn the full per-venue runtime: one manager worker per book
    /// symbol plus the connection task. Returns every join handle.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        venue: VenueConfig,
        adapter: Arc<dyn VenueAdapter>,
        orderbook: OrderBookConfig,
        publisher: PublisherHandle,
        stats: &StatsRegistry,
        health: Arc<ServiceHealth>,
        degraded: Arc<DegradedSymbols>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let mut book_channels = HashMap::new();
        let (resubscribe_tx, resubscribe_rx) = mpsc::channel(64);
        let manager_counters = ManagerCounters::new(stats);
        let snapshots: Arc<dyn SnapshotSource> = Arc::new(AdapterSnapshots(adapter.clone()));

        if venue.data_types.contains(&DataType::OrderBook) {
            for canonical in &venue.symbols {
                let venue_symbol = stream_symbol(venue.exchange, canonical);
                let (tx, rx) = mpsc::channel(orderbook.channel_capacity);
                book_channels.insert(venue_symbol.clone(), tx);

                let manager = BookManager::new(
                    venue.exchange,
                    canonical.clone(),
                    venue_symbol,
                    orderbook.clone(),
                    snapshots.clone(),
                    Some(resubscribe_tx.clone()),
                    Arc::new(publisher.clone()),
                    degraded.clone(),
                    manager_counters.clone(),
                );
                handles.push(tokio::spawn(manager.run(rx, shutdown.clone())));
            }
        }

        let supervisor = Self {
            venue,
            adapter,
            publisher,
            book_channels,
            resubscribe_rx,
            backoff: Backoff::reconnect(),
            counters: SupervisorCounters::new(stats),
            health,
            shutdown,
        };
        handles.push(tokio::spawn(supervisor.run()));
        handles
    }

    fn check_name(&self) -> String {
        format!("venue.{}", self.venue.exchange)
    }

    /// Connection loop: reconnect forever with capped, jittered backoff.
    async fn run(mut self) {
        // Venues with nothing streamed (Deribit) need no socket.
        if self.adapter.subscribe_frames().is_empty() && self.book_channels.is_empty() {
            info!(exchange = %self.venue.exchange, "no streamed data types, skipping websocket");
            return;
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.run_connection().await {
                Ok(ConnectionEnd::Shutdown) => break,
                // Rotation outcomes are absorbed inside run_connection.
                Ok(ConnectionEnd::Rotating) => {}
                Err(e) => {
                    self.counters.reconnects.inc();
                    self.health.set_check(
                        &self.check_name(),
                        HealthStatus::Degraded,
                        Some(e.to_string()),
                    );
                    let delay = jittered(self.backoff.next_delay());
                    warn!(
                        exchange = %self.venue.exchange,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "connection lost, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        self.health.clear_check(&self.check_name());
        info!(exchange = %self.venue.exchange, "venue supervisor stopped");
    }

    async fn open_and_subscribe(&self) -> Result<WsConnection> {
        let mut connection = WsConnection::open(
            self.venue.exchange,
            self.adapter.ws_url(),
            Duration::from_secs(self.venue.connect_timeout_secs),
        )
        .await?;
        for frame in self.adapter.subscribe_frames() {
            connection.send(frame).await?;
        }
        Ok(connection)
    }

    async fn run_connection(&mut self) -> Result<ConnectionEnd> {
        let mut connection = self.open_and_subscribe().await?;
        self.backoff.reset();
        self.health.set_healthy(&self.check_name());
        let mut shutdown = self.shutdown.clone();

        let rotation_enabled = self.venue.rotation.enabled;
        let mut rotation = RotationState::new(
            Duration::from_secs(self.venue.rotation.rotate_after_secs),
            Duration::from_secs(self.venue.rotation.overlap_secs),
        );
        let keepalive = self.adapter.keepalive_frame();
        let mut last_keepalive = Instant::now();
        let idle_timeout = Duration::from_secs(self.venue.idle_timeout_secs);

        loop {
            let timer_deadline = next_timer(
                &rotation,
                rotation_enabled,
                keepalive.as_ref().map(|(_, interval)| last_keepalive + *interval),
            );

            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        connection.close().await;
                        return Ok(ConnectionEnd::Shutdown);
                    }
                }

                Some(symbol) = self.resubscribe_rx.recv() => {
                    for frame in self.adapter.resubscribe_depth_frames(&symbol) {
                        connection.send(frame).await?;
                    }
                    debug!(exchange = %self.venue.exchange, symbol, "depth channel resubscribed");
                }

                maybe = connection.recv() => {
                    match maybe? {
                        Some(message) => {
                            self.handle_message(&mut connection, message, None).await?;
                        }
                        None => {
                            return Err(IngestError::ConnectionLost {
                                exchange: self.venue.exchange,
                                reason: None,
                            });
                        }
                    }
                }

                _ = tokio::time::sleep_until(timer_deadline) => {}
            }

            if connection.idle() > idle_timeout {
                return Err(IngestError::ConnectionTimeout {
                    exchange: self.venue.exchange,
                    timeout_ms: idle_timeout.as_millis() as u64,
                });
            }

            if let Some((frame, interval)) = &keepalive {
                if last_keepalive.elapsed() >= *interval {
                    connection.send(frame.clone()).await?;
                    last_keepalive = Instant::now();
                }
            }

            if rotation_enabled && rotation.due() {
                if let ConnectionEnd::Shutdown = self
                    .rotate_connection(&mut connection, &mut rotation)
                    .await?
                {
                    return Ok(ConnectionEnd::Shutdown);
                }
            }
        }
    }

    /// Open a replacement connection and run the overlap window, dropping
    /// duplicates by venue-native id. An unhealthy replacement aborts the
    /// rotation and the old connection stays.
    async fn rotate_connection(
        &mut self,
        connection: &mut WsConnection,
        rotation: &mut RotationState,
    ) -> Result<ConnectionEnd> {
        info!(exchange = %self.venue.exchange, "proactive rotation starting");
        let mut replacement = match self.open_and_subscribe().await {
            Ok(replacement) => replacement,
            Err(e) => {
                warn!(exchange = %self.venue.exchange, error = %e, "rotation aborted: replacement failed to connect");
                self.counters.rotation_aborts.inc();
                rotation.abort();
                return Ok(ConnectionEnd::Rotating);
            }
        };

        rotation.begin_overlap();
        let mut dedup = RecentIds::new(self.venue.rotation.dedup_capacity);
        let overlap_end = rotation.next_deadline();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        replacement.close().await;
                        connection.close().await;
                        return Ok(ConnectionEnd::Shutdown);
                    }
                }

                maybe = connection.recv() => {
                    match maybe {
                        Ok(Some(message)) => {
                            self.handle_message(connection, message, Some(&mut dedup)).await?;
                        }
                        // The old connection dying mid-overlap just ends
                        // the overlap early.
                        Ok(None) | Err(_) => break,
                    }
                }

                maybe = replacement.recv() => {
                    match maybe {
                        Ok(Some(message)) => {
                            self.handle_message(&mut replacement, message, Some(&mut dedup)).await?;
                        }
                        Ok(None) | Err(_) => {
                            warn!(exchange = %self.venue.exchange, "rotation aborted: replacement dropped");
                            self.counters.rotation_aborts.inc();
                            rotation.abort();
                            return Ok(ConnectionEnd::Rotating);
                        }
                    }
                }

                _ = tokio::time::sleep_until(overlap_end) => break,
            }
        }

        // Healthy means the replacement actually delivered something
        // during the overlap.
        if replacement.idle() >= rotation.overlap() {
            warn!(exchange = %self.venue.exchange, "rotation aborted: replacement stayed silent");
            self.counters.rotation_aborts.inc();
            replacement.close().await;
            rotation.abort();
            return Ok(ConnectionEnd::Rotating);
        }

        let mut old = std::mem::replace(connection, replacement);
        old.close().await;
        rotation.complete();
        self.counters.rotations.inc();
        info!(exchange = %self.venue.exchange, "rotation complete");
        Ok(ConnectionEnd::Rotating)
    }

    /// Heartbeat, decode, dispatch. `overlap_dedup` is set only while two
    /// connections deliver concurrently.
    async fn handle_message(
        &mut self,
        connection: &mut WsConnection,
        message: tokio_tungstenite::tungstenite::Message,
        mut overlap_dedup: Option<&mut RecentIds>,
    ) -> Result<()> {
        use tokio_tungstenite::tungstenite::Message;

        self.counters.messages_received.inc();

        if let Some(reply) = self.adapter.heartbeat_reply(&message) {
            connection.send(reply).await?;
        }

        let text = match message {
            Message::Text(text) => text,
            Message::Close(frame) => {
                return Err(IngestError::ConnectionLost {
                    exchange: self.venue.exchange,
                    reason: frame.map(|f| f.reason.to_string()),
                });
            }
            // Control frames carry no payload we collect.
            _ => return Ok(()),
        };

        let events = match self.adapter.decode(&text) {
            Ok(events) => events,
            Err(IngestError::ProtocolViolation { detail, .. }) => {
                self.counters.protocol_violations.inc();
                debug!(exchange = %self.venue.exchange, detail, "dropping unparseable frame");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for event in events {
            self.dispatch(event, overlap_dedup.as_deref_mut()).await;
        }
        Ok(())
    }

    async fn dispatch(&self, event: VenueEvent, overlap_dedup: Option<&mut RecentIds>) {
        match event {
            VenueEvent::BookDiff(diff) => {
                if let Some(dedup) = overlap_dedup {
                    let id = format!("book:{}:{}", diff.symbol, diff.last_update_id);
                    if !dedup.insert(&id) {
                        return;
                    }
                }
                if let Some(tx) = self.book_channels.get(&diff.symbol) {
                    // Bounded channel: a slow manager backpressures this
                    // reader and, through TCP, the venue.
                    if tx.send(diff).await.is_err() {
                        debug!("book manager gone, dropping diff");
                    }
                } else {
                    debug!(symbol = diff.symbol, "depth update for unsubscribed symbol");
                }
            }
            VenueEvent::Trade(raw) => {
                if let Some(dedup) = overlap_dedup {
                    let id = format!("trade:{}:{}", raw.symbol, raw.trade_id);
                    if !dedup.insert(&id) {
                        return;
                    }
                }
                self.push_normalized(normalize::trade(self.venue.exchange, raw));
            }
            VenueEvent::Funding(raw) => {
                self.push_normalized(normalize::funding(self.venue.exchange, raw));
            }
            VenueEvent::OpenInterest(raw) => {
                self.push_normalized(normalize::open_interest(self.venue.exchange, raw));
            }
            VenueEvent::Liquidation(raw) => {
                self.push_normalized(normalize::liquidation(self.venue.exchange, raw));
            }
            VenueEvent::VolatilityIndex(raw) => {
                self.push_normalized(normalize::volatility_index(self.venue.exchange, raw));
            }
            VenueEvent::SubscriptionAck(channel) => {
                debug!(exchange = %self.venue.exchange, channel, "subscription acknowledged");
            }
            VenueEvent::Pong | VenueEvent::Ignored => {}
        }
    }

    fn push_normalized(&self, record: Result<types::records::MarketRecord>) {
        match record {
            Ok(record) => self.publisher.push(record),
            Err(e) => {
                self.counters.protocol_violations.inc();
                debug!(exchange = %self.venue.exchange, error = %e, "normalization failed");
            }
        }
    }
}

/// The venue-native spelling of a canonical symbol in stream messages.
fn stream_symbol(exchange: Exchange, canonical: &str) -> String {
    match exchange {
        Exchange::BinanceSpot | Exchange::BinanceDerivatives => concat_form(canonical),
        Exchange::OkxSpot => okx_inst_id(canonical, false),
        Exchange::OkxDerivatives => okx_inst_id(canonical, true),
        Exchange::DeribitDerivatives => canonical.to_string(),
    }
}

fn next_timer(
    rotation: &RotationState,
    rotation_enabled: bool,
    keepalive_at: Option<Instant>,
) -> Instant {
    let fallback = Instant::now() + Duration::from_secs(30);
    let mut deadline = fallback;
    if rotation_enabled {
        deadline = deadline.min(rotation.next_deadline());
    }
    if let Some(keepalive_at) = keepalive_at {
        deadline = deadline.min(keepalive_at);
    }
    deadline
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::symbol::canonical_symbol;

    #[test]
    fn stream_symbols_match_venue_spelling() {
        assert_eq!(stream_symbol(Exchange::BinanceSpot, "BTC-USDT"), "BTCUSDT");
        assert_eq!(stream_symbol(Exchange::OkxSpot, "BTC-USDT"), "BTC-USDT");
        assert_eq!(
            stream_symbol(Exchange::OkxDerivatives, "BTC-USDT"),
            "BTC-USDT-SWAP"
        );
    }

    #[test]
    fn canonicalization_round_trips_through_stream_symbols() {
        for exchange in [
            Exchange::BinanceSpot,
            Exchange::OkxSpot,
            Exchange::OkxDerivatives,
        ] {
            let venue_form = stream_symbol(exchange, "BTC-USDT");
            assert_eq!(canonical_symbol(&venue_form).unwrap(), "BTC-USDT");
        }
    }
}
