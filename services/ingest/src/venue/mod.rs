//! Venue adapters.
//!
//! One adapter per upstream feed, all behind [`VenueAdapter`]. An adapter
//! knows how to build subscribe frames, decode text frames into
//! [`VenueEvent`]s, keep the venue's heartbeat alive, and call the venue's
//! REST endpoints through the shared weight budget. Adapters are
//! stateless transformers; books, dedup, and lifecycle live elsewhere.

mod binance;
mod deribit;
mod okx;

pub use binance::BinanceAdapter;
pub use deribit::DeribitAdapter;
pub use okx::OkxAdapter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio_tungstenite::tungstenite::Message;
use types::records::{LsrVariant, Side};
use types::venue::Exchange;

use crate::error::{IngestError, Result};
use crate::rate_limit::VenueLimiter;
use config::VenueConfig;

/// A raw trade as the venue reported it; symbol still in venue form.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTrade {
    pub symbol: String,
    pub trade_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    pub is_maker: Option<bool>,
    pub event_time_ms: Option<i64>,
}

/// A raw depth message: an incremental diff, or a full snapshot when
/// `is_snapshot` is set (OKX sends snapshots in-band).
#[derive(Debug, Clone, PartialEq)]
pub struct RawBookDiff {
    pub symbol: String,
    pub first_update_id: u64,
    pub last_update_id: u64,
    /// Binance derivatives `pu` / OKX `prevSeqId` chain link. OKX's
    /// explicit reset marker (`prevSeqId == -1`) arrives as `is_snapshot`.
    pub prev_update_id: Option<u64>,
    pub is_snapshot: bool,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    /// Venue CRC over the top of the book (OKX), as a signed 32-bit value.
    pub checksum: Option<i32>,
    pub event_time_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawFunding {
    pub symbol: String,
    pub rate: Decimal,
    pub funding_time_ms: Option<i64>,
    pub next_funding_time_ms: Option<i64>,
    pub event_time_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawOpenInterest {
    pub symbol: String,
    pub open_interest: Decimal,
    pub notional_usd: Option<Decimal>,
    pub event_time_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawLiquidation {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub liquidation_id: Option<String>,
    pub event_time_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawLsr {
    pub symbol: String,
    pub variant: LsrVariant,
    pub ratio: Decimal,
    pub long_pct: Option<Decimal>,
    pub short_pct: Option<Decimal>,
    pub period: String,
    pub event_time_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawVolatilityIndex {
    pub currency: String,
    pub value: Decimal,
    pub resolution_secs: u32,
    pub event_time_ms: Option<i64>,
}

/// One decoded venue frame.
#[derive(Debug, Clone, PartialEq)]
pub enum VenueEvent {
    Trade(RawTrade),
    BookDiff(RawBookDiff),
    Funding(RawFunding),
    OpenInterest(RawOpenInterest),
    Liquidation(RawLiquidation),
    VolatilityIndex(RawVolatilityIndex),
    /// Venue acknowledged a heartbeat.
    Pong,
    /// Venue acknowledged a subscription.
    SubscriptionAck(String),
    /// Valid frame carrying nothing the pipeline collects.
    Ignored,
}

/// Capability set every venue implements. Dispatch is by [`Exchange`];
/// shared behavior (weight budget, heartbeats, backoff) is composed in,
/// not inherited.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    fn ws_url(&self) -> &str;

    /// Frames subscribing every configured stream, sent right after
    /// connect.
    fn subscribe_frames(&self) -> Vec<Message>;

    /// Frames that re-subscribe a single symbol's depth stream (used on
    /// venues whose book resync is a re-subscription).
    fn resubscribe_depth_frames(&self, _symbol: &str) -> Vec<Message> {
        Vec::new()
    }

    /// Decode one inbound frame into zero or more events.
    fn decode(&self, text: &str) -> Result<Vec<VenueEvent>>;

    /// Reply required to keep the venue heartbeat alive, if this frame
    /// demands one.
    fn heartbeat_reply(&self, message: &Message) -> Option<Message>;

    /// Frame the client must send proactively when the connection has been
    /// quiet for the returned interval (OKX-style keepalive).
    fn keepalive_frame(&self) -> Option<(Message, Duration)> {
        None
    }

    /// REST depth snapshot for the join-point, on venues that sync books
    /// over REST.
    async fn fetch_book_snapshot(&self, _symbol: &str) -> Result<RawBookDiff> {
        Err(self.unsupported("book snapshot"))
    }

    async fn fetch_funding(&self, _symbol: &str) -> Result<RawFunding> {
        Err(self.unsupported("funding rate"))
    }

    async fn fetch_open_interest(&self, _symbol: &str) -> Result<RawOpenInterest> {
        Err(self.unsupported("open interest"))
    }

    async fn fetch_long_short_ratio(
        &self,
        _symbol: &str,
        _variant: LsrVariant,
        _period: &str,
    ) -> Result<RawLsr> {
        Err(self.unsupported("long/short ratio"))
    }

    async fn fetch_volatility_index(&self, _currency: &str) -> Result<RawVolatilityIndex> {
        Err(self.unsupported("volatility index"))
    }

    #[doc(hidden)]
    fn unsupported(&self, operation: &'static str) -> IngestError {
        IngestError::Unsupported {
            exchange: self.exchange(),
            operation,
        }
    }
}

/// Build the adapter for a configured venue.
pub fn make_adapter(
    venue: &VenueConfig,
    limiter: Arc<VenueLimiter>,
    http: reqwest::Client,
) -> Arc<dyn VenueAdapter> {
    match venue.exchange {
        Exchange::BinanceSpot | Exchange::BinanceDerivatives => {
            Arc::new(BinanceAdapter::new(venue, limiter, http))
        }
        Exchange::OkxSpot | Exchange::OkxDerivatives => {
            Arc::new(OkxAdapter::new(venue, limiter, http))
        }
        Exchange::DeribitDerivatives => Arc::new(DeribitAdapter::new(venue, limiter, http)),
    }
}

/// Shared REST GET honoring the venue weight budget and the rate-limit
/// penalty protocol.
pub(crate) async fn venue_get(
    http: &reqwest::Client,
    limiter: &VenueLimiter,
    exchange: Exchange,
    url: &str,
    weight: u32,
) -> Result<serde_json::Value> {
    limiter.acquire(weight).await;

    let response = http.get(url).send().await?;
    let status = response.status();

    if status.as_u16() == 429 || status.as_u16() == 418 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        limiter.on_rate_limited(retry_after);
        return Err(IngestError::VenueRateLimit {
            exchange,
            retry_after,
        });
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(IngestError::Rest {
            exchange,
            status: status.as_u16(),
            body,
        });
    }

    limiter.on_success();
    Ok(response.json().await?)
}

/// Parse a venue decimal string, reporting garbage as a protocol
/// violation rather than tearing the stream down.
pub(crate) fn parse_decimal(raw: &str, exchange: Exchange) -> Result<Decimal> {
    raw.parse::<Decimal>()
        .map_err(|_| IngestError::ProtocolViolation {
            exchange,
            detail: format!("unparseable decimal: {raw:?}"),
        })
}
