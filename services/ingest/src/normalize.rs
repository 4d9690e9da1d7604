//! Normalization: raw venue events to canonical records.
//!
//! Three conventions are enforced here and nowhere else:
//! - `timestamp` is the venue event time when provided, else the reception
//!   wall clock; `collected_at` is always the reception wall clock; both
//!   are truncated to milliseconds.
//! - Symbols leave in canonical `BASE-QUOTE` form.
//! - Order-book `last_update_id` carries sequence identity only; it is
//!   never synthesized from a timestamp.

use chrono::{DateTime, Utc};
use types::records::{
    FundingRate, Liquidation, LongShortRatio, MarketRecord, OpenInterest, OrderBookSnapshot,
    Trade, VolatilityIndex,
};
use types::symbol::canonical_symbol;
use types::time::{from_epoch_millis, now_millis};
use types::venue::Exchange;

use crate::error::Result;
use crate::orderbook::LocalBook;
use crate::venue::{
    RawFunding, RawLiquidation, RawLsr, RawOpenInterest, RawTrade, RawVolatilityIndex,
};

/// Venue event time when present, else the moment of reception.
fn event_time(event_time_ms: Option<i64>, collected_at: DateTime<Utc>) -> DateTime<Utc> {
    event_time_ms
        .and_then(from_epoch_millis)
        .unwrap_or(collected_at)
}

pub fn trade(exchange: Exchange, raw: RawTrade) -> Result<MarketRecord> {
    let collected_at = now_millis();
    Ok(MarketRecord::Trade(Trade {
        exchange,
        market_type: exchange.market_type(),
        symbol: canonical_symbol(&raw.symbol)?,
        trade_id: raw.trade_id,
        price: raw.price,
        quantity: raw.quantity,
        side: raw.side,
        is_maker: raw.is_maker,
        timestamp: event_time(raw.event_time_ms, collected_at),
        collected_at,
    }))
}

/// Build the published top-N snapshot from live book state. The symbol is
/// already canonical here; managers are keyed by canonical symbols.
pub fn book_snapshot(
    exchange: Exchange,
    symbol: &str,
    book: &LocalBook,
    publish_depth: usize,
    last_update_id: u64,
    event_time_ms: Option<i64>,
) -> MarketRecord {
    let collected_at = now_millis();
    let (bids, asks) = book.top(publish_depth);
    MarketRecord::OrderBook(OrderBookSnapshot {
        exchange,
        market_type: exchange.market_type(),
        symbol: symbol.to_string(),
        last_update_id,
        best_bid: bids.first().map(|level| level.price),
        best_ask: asks.first().map(|level| level.price),
        bids,
        asks,
        timestamp: event_time(event_time_ms, collected_at),
        collected_at,
    })
}

pub fn funding(exchange: Exchange, raw: RawFunding) -> Result<MarketRecord> {
    let collected_at = now_millis();
    Ok(MarketRecord::FundingRate(FundingRate {
        exchange,
        market_type: exchange.market_type(),
        symbol: canonical_symbol(&raw.symbol)?,
        funding_rate: raw.rate,
        funding_time: raw.funding_time_ms.and_then(from_epoch_millis),
        next_funding_time: raw.next_funding_time_ms.and_then(from_epoch_millis),
        timestamp: event_time(raw.event_time_ms, collected_at),
        collected_at,
    }))
}

pub fn open_interest(exchange: Exchange, raw: RawOpenInterest) -> Result<MarketRecord> {
    let collected_at = now_millis();
    Ok(MarketRecord::OpenInterest(OpenInterest {
        exchange,
        market_type: exchange.market_type(),
        symbol: canonical_symbol(&raw.symbol)?,
        open_interest: raw.open_interest,
        notional_usd: raw.notional_usd,
        timestamp: event_time(raw.event_time_ms, collected_at),
        collected_at,
    }))
}

pub fn liquidation(exchange: Exchange, raw: RawLiquidation) -> Result<MarketRecord> {
    let collected_at = now_millis();
    Ok(MarketRecord::Liquidation(Liquidation {
        exchange,
        market_type: exchange.market_type(),
        symbol: canonical_symbol(&raw.symbol)?,
        side: raw.side,
        price: raw.price,
        quantity: raw.quantity,
        liquidation_id: raw.liquidation_id,
        timestamp: event_time(raw.event_time_ms, collected_at),
        collected_at,
    }))
}

pub fn long_short_ratio(exchange: Exchange, raw: RawLsr) -> Result<MarketRecord> {
    let collected_at = now_millis();
    Ok(MarketRecord::LongShortRatio(LongShortRatio {
        variant: raw.variant,
        exchange,
        market_type: exchange.market_type(),
        symbol: canonical_symbol(&raw.symbol)?,
        ratio: raw.ratio,
        long_pct: raw.long_pct,
        short_pct: raw.short_pct,
        period: raw.period,
        timestamp: event_time(raw.event_time_ms, collected_at),
        collected_at,
    }))
}

pub fn volatility_index(exchange: Exchange, raw: RawVolatilityIndex) -> Result<MarketRecord> {
    let collected_at = now_millis();
    Ok(MarketRecord::VolatilityIndex(VolatilityIndex {
        exchange,
        market_type: exchange.market_type(),
        currency: raw.currency,
        value: raw.value,
        resolution_secs: raw.resolution_secs,
        timestamp: event_time(raw.event_time_ms, collected_at),
        collected_at,
    }))
}
