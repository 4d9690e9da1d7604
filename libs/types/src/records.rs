//! Canonical record structs.
//!
//! These are the payloads that cross the bus and land in the analytical
//! store. Field names are the wire contract. `timestamp` is the venue event
//! time (or reception time when the venue provides none); `collected_at` is
//! always the reception wall clock. Both serialize as
//! `YYYY-MM-DD HH:MM:SS.mmm` UTC.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::time::{serde_millis, serde_millis_opt};
use crate::venue::{DataType, Exchange, MarketType};

/// Taker side of a trade or liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// Long/short-ratio flavor: notional of top traders vs. account counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LsrVariant {
    TopPosition,
    AllAccount,
}

impl LsrVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            LsrVariant::TopPosition => "top_position",
            LsrVariant::AllAccount => "all_account",
        }
    }
}

/// One resting price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub symbol: String,
    pub trade_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_maker: Option<bool>,
    #[serde(with = "serde_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_millis")]
    pub collected_at: DateTime<Utc>,
}

/// A published top-N view of one book.
///
/// The incremental updates feeding it stay internal to the ingestion
/// service; only synchronized snapshots reach the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub symbol: String,
    /// Sequence identity of the last applied update. Monotonically
    /// non-decreasing per (exchange, market, symbol).
    pub last_update_id: u64,
    /// Strictly descending by price.
    pub bids: Vec<PriceLevel>,
    /// Strictly ascending by price.
    pub asks: Vec<PriceLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<Decimal>,
    #[serde(with = "serde_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_millis")]
    pub collected_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    /// Validate the published-book invariants: strict ordering on both
    /// sides and no crossed market.
    pub fn is_well_formed(&self) -> bool {
        let bids_descending = self
            .bids
            .windows(2)
            .all(|pair| pair[0].price > pair[1].price);
        let asks_ascending = self
            .asks
            .windows(2)
            .all(|pair| pair[0].price < pair[1].price);
        let not_crossed = match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => bid < ask,
            _ => true,
        };
        bids_descending && asks_ascending && not_crossed
    }
}

/// Periodic funding payment rate on a perpetual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub symbol: String,
    pub funding_rate: Decimal,
    #[serde(default, with = "serde_millis_opt", skip_serializing_if = "Option::is_none")]
    pub funding_time: Option<DateTime<Utc>>,
    #[serde(default, with = "serde_millis_opt", skip_serializing_if = "Option::is_none")]
    pub next_funding_time: Option<DateTime<Utc>>,
    #[serde(with = "serde_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_millis")]
    pub collected_at: DateTime<Utc>,
}

/// Outstanding contracts on a derivative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub symbol: String,
    pub open_interest: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional_usd: Option<Decimal>,
    #[serde(with = "serde_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_millis")]
    pub collected_at: DateTime<Utc>,
}

/// A forced position close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidation {
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liquidation_id: Option<String>,
    #[serde(with = "serde_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_millis")]
    pub collected_at: DateTime<Utc>,
}

/// Market positioning ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongShortRatio {
    pub variant: LsrVariant,
    pub exchange: Exchange,
    pub market_type: MarketType,
    pub symbol: String,
    pub ratio: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_pct: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_pct: Option<Decimal>,
    /// Sampling period the venue aggregated over, e.g. `5m`.
    pub period: String,
    #[serde(with = "serde_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_millis")]
    pub collected_at: DateTime<Utc>,
}

/// Venue-computed implied-volatility index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityIndex {
    pub exchange: Exchange,
    pub market_type: MarketType,
    /// Underlying currency, e.g. `BTC`. Volatility indices have no
    /// symbol-level granularity.
    pub currency: String,
    pub value: Decimal,
    /// Sample resolution in seconds.
    pub resolution_secs: u32,
    #[serde(with = "serde_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_millis")]
    pub collected_at: DateTime<Utc>,
}

/// Any canonical record, as handed to the publish path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketRecord {
    Trade(Trade),
    #[serde(rename = "orderbook")]
    OrderBook(OrderBookSnapshot),
    FundingRate(FundingRate),
    OpenInterest(OpenInterest),
    Liquidation(Liquidation),
    LongShortRatio(LongShortRatio),
    VolatilityIndex(VolatilityIndex),
}

impl MarketRecord {
    pub fn data_type(&self) -> DataType {
        match self {
            MarketRecord::Trade(_) => DataType::Trade,
            MarketRecord::OrderBook(_) => DataType::OrderBook,
            MarketRecord::FundingRate(_) => DataType::FundingRate,
            MarketRecord::OpenInterest(_) => DataType::OpenInterest,
            MarketRecord::Liquidation(_) => DataType::Liquidation,
            MarketRecord::LongShortRatio(_) => DataType::LongShortRatio,
            MarketRecord::VolatilityIndex(_) => DataType::VolatilityIndex,
        }
    }

    pub fn exchange(&self) -> Exchange {
        match self {
            MarketRecord::Trade(r) => r.exchange,
            MarketRecord::OrderBook(r) => r.exchange,
            MarketRecord::FundingRate(r) => r.exchange,
            MarketRecord::OpenInterest(r) => r.exchange,
            MarketRecord::Liquidation(r) => r.exchange,
            MarketRecord::LongShortRatio(r) => r.exchange,
            MarketRecord::VolatilityIndex(r) => r.exchange,
        }
    }

    pub fn market_type(&self) -> MarketType {
        match self {
            MarketRecord::Trade(r) => r.market_type,
            MarketRecord::OrderBook(r) => r.market_type,
            MarketRecord::FundingRate(r) => r.market_type,
            MarketRecord::OpenInterest(r) => r.market_type,
            MarketRecord::Liquidation(r) => r.market_type,
            MarketRecord::LongShortRatio(r) => r.market_type,
            MarketRecord::VolatilityIndex(r) => r.market_type,
        }
    }

    /// Instrument key: canonical symbol, or the underlying currency for
    /// volatility indices.
    pub fn symbol(&self) -> &str {
        match self {
            MarketRecord::Trade(r) => &r.symbol,
            MarketRecord::OrderBook(r) => &r.symbol,
            MarketRecord::FundingRate(r) => &r.symbol,
            MarketRecord::OpenInterest(r) => &r.symbol,
            MarketRecord::Liquidation(r) => &r.symbol,
            MarketRecord::LongShortRatio(r) => &r.symbol,
            MarketRecord::VolatilityIndex(r) => &r.currency,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MarketRecord::Trade(r) => r.timestamp,
            MarketRecord::OrderBook(r) => r.timestamp,
            MarketRecord::FundingRate(r) => r.timestamp,
            MarketRecord::OpenInterest(r) => r.timestamp,
            MarketRecord::Liquidation(r) => r.timestamp,
            MarketRecord::LongShortRatio(r) => r.timestamp,
            MarketRecord::VolatilityIndex(r) => r.timestamp,
        }
    }

    pub fn collected_at(&self) -> DateTime<Utc> {
        match self {
            MarketRecord::Trade(r) => r.collected_at,
            MarketRecord::OrderBook(r) => r.collected_at,
            MarketRecord::FundingRate(r) => r.collected_at,
            MarketRecord::OpenInterest(r) => r.collected_at,
            MarketRecord::Liquidation(r) => r.collected_at,
            MarketRecord::LongShortRatio(r) => r.collected_at,
            MarketRecord::VolatilityIndex(r) => r.collected_at,
        }
    }
}
