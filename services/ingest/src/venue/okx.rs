//! OKX adapter, covering spot and perpetual swaps.
//!
//! OKX multiplexes channels over one socket with `op: subscribe` frames.
//! Depth messages form a per-symbol `seqId`/`prevSeqId` chain and carry a
//! CRC32 checksum over the top 25 levels; the first message after a
//! subscription is a full snapshot (`action: "snapshot"`, `prevSeqId: -1`).
//! Heartbeat is textual: an idle connection exchanges literal `ping` /
//! `pong` frames roughly every 25 seconds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use types::records::{LsrVariant, Side};
use types::symbol::okx_inst_id;
use types::venue::{DataType, Exchange, MarketType};

use super::{
    parse_decimal, venue_get, RawBookDiff, RawFunding, RawLiquidation, RawLsr, RawOpenInterest,
    RawTrade, VenueAdapter, VenueEvent,
};
use crate::error::{IngestError, Result};
use crate::rate_limit::VenueLimiter;
use config::VenueConfig;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

pub struct OkxAdapter {
    exchange: Exchange,
    ws_url: String,
    rest_url: String,
    symbols: Vec<String>,
    data_types: Vec<DataType>,
    limiter: Arc<VenueLimiter>,
    http: reqwest::Client,
}

impl OkxAdapter {
    pub fn new(venue: &VenueConfig, limiter: Arc<VenueLimiter>, http: reqwest::Client) -> Self {
        Self {
            exchange: venue.exchange,
            ws_url: venue.ws_url.clone(),
            rest_url: venue.rest_url.clone(),
            symbols: venue.symbols.clone(),
            data_types: venue.data_types.clone(),
            limiter,
            http,
        }
    }

    fn is_perpetual(&self) -> bool {
        self.exchange.market_type() == MarketType::Perpetual
    }

    fn inst_id(&self, canonical: &str) -> String {
        okx_inst_id(canonical, self.is_perpetual())
    }

    fn channel_args(&self) -> Vec<Value> {
        let mut args = Vec::new();
        for data_type in &self.data_types {
            match data_type {
                DataType::Trade => {
                    for symbol in &self.symbols {
                        args.push(serde_json::json!({
                            "channel": "trades",
                            "instId": self.inst_id(symbol),
                        }));
                    }
                }
                DataType::OrderBook => {
                    for symbol in &self.symbols {
                        args.push(serde_json::json!({
                            "channel": "books",
                            "instId": self.inst_id(symbol),
                        }));
                    }
                }
                DataType::FundingRate if self.is_perpetual() => {
                    for symbol in &self.symbols {
                        args.push(serde_json::json!({
                            "channel": "funding-rate",
                            "instId": self.inst_id(symbol),
                        }));
                    }
                }
                DataType::OpenInterest if self.is_perpetual() => {
                    for symbol in &self.symbols {
                        args.push(serde_json::json!({
                            "channel": "open-interest",
                            "instId": self.inst_id(symbol),
                        }));
                    }
                }
                DataType::Liquidation if self.is_perpetual() => {
                    args.push(serde_json::json!({
                        "channel": "liquidation-orders",
                        "instType": "SWAP",
                    }));
                }
                _ => {}
            }
        }
        args
    }

    fn decode_trades(&self, data: Vec<Value>) -> Result<Vec<VenueEvent>> {
        data.into_iter()
            .map(|entry| {
                let trade: TradeRow = self.from_value(entry)?;
                Ok(VenueEvent::Trade(RawTrade {
                    symbol: trade.inst_id,
                    trade_id: trade.trade_id,
                    price: parse_decimal(&trade.price, self.exchange)?,
                    quantity: parse_decimal(&trade.size, self.exchange)?,
                    side: parse_side(&trade.side, self.exchange)?,
                    is_maker: None,
                    event_time_ms: parse_ms(&trade.ts),
                }))
            })
            .collect()
    }

    fn decode_books(&self, action: Option<&str>, inst_id: &str, data: Vec<Value>) -> Result<Vec<VenueEvent>> {
        let snapshot_action = action == Some("snapshot");
        data.into_iter()
            .map(|entry| {
                let book: BookRow = self.from_value(entry)?;
                // prevSeqId == -1 (or a self-referencing chain) is the
                // venue's explicit reset marker.
                let is_snapshot =
                    snapshot_action || book.prev_seq_id < 0 || book.prev_seq_id == book.seq_id;
                let seq_id = u64::try_from(book.seq_id).unwrap_or(0);
                Ok(VenueEvent::BookDiff(RawBookDiff {
                    symbol: inst_id.to_string(),
                    first_update_id: seq_id,
                    last_update_id: seq_id,
                    prev_update_id: u64::try_from(book.prev_seq_id).ok().filter(|_| !is_snapshot),
                    is_snapshot,
                    bids: self.decode_levels(book.bids)?,
                    asks: self.decode_levels(book.asks)?,
                    checksum: book.checksum,
                    event_time_ms: parse_ms(&book.ts),
                }))
            })
            .collect()
    }

    fn decode_funding(&self, data: Vec<Value>) -> Result<Vec<VenueEvent>> {
        data.into_iter()
            .map(|entry| {
                let row: FundingRow = self.from_value(entry)?;
                Ok(VenueEvent::Funding(RawFunding {
                    symbol: row.inst_id,
                    rate: parse_decimal(&row.funding_rate, self.exchange)?,
                    funding_time_ms: row.funding_time.as_deref().and_then(parse_ms),
                    next_funding_time_ms: row.next_funding_time.as_deref().and_then(parse_ms),
                    event_time_ms: row.ts.as_deref().and_then(parse_ms),
                }))
            })
            .collect()
    }

    fn decode_open_interest(&self, data: Vec<Value>) -> Result<Vec<VenueEvent>> {
        data.into_iter()
            .map(|entry| {
                let row: OpenInterestRow = self.from_value(entry)?;
                Ok(VenueEvent::OpenInterest(RawOpenInterest {
                    symbol: row.inst_id,
                    open_interest: parse_decimal(&row.oi, self.exchange)?,
                    notional_usd: row
                        .oi_usd
                        .as_deref()
                        .and_then(|usd| usd.parse().ok()),
                    event_time_ms: parse_ms(&row.ts),
                }))
            })
            .collect()
    }

    fn decode_liquidations(&self, data: Vec<Value>) -> Result<Vec<VenueEvent>> {
        let mut events = Vec::new();
        for entry in data {
            let row: LiquidationRow = self.from_value(entry)?;
            for detail in row.details {
                events.push(VenueEvent::Liquidation(RawLiquidation {
                    symbol: row.inst_id.clone(),
                    side: parse_side(&detail.side, self.exchange)?,
                    price: parse_decimal(&detail.bankruptcy_price, self.exchange)?,
                    quantity: parse_decimal(&detail.size, self.exchange)?,
                    liquidation_id: None,
                    event_time_ms: parse_ms(&detail.ts),
                }));
            }
        }
        Ok(events)
    }

    fn decode_levels(
        &self,
        raw: Vec<Vec<String>>,
    ) -> Result<Vec<(rust_decimal::Decimal, rust_decimal::Decimal)>> {
        raw.into_iter()
            .map(|level| {
                // Levels are [price, size, deprecated, order-count]; only
                // the first two matter.
                let price = level.first().ok_or_else(|| self.violation("empty level"))?;
                let size = level.get(1).ok_or_else(|| self.violation("level missing size"))?;
                Ok((
                    parse_decimal(price, self.exchange)?,
                    parse_decimal(size, self.exchange)?,
                ))
            })
            .collect()
    }

    fn from_value<T: serde::de::DeserializeOwned>(&self, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| self.violation(&e.to_string()))
    }

    fn violation(&self, detail: &str) -> IngestError {
        IngestError::ProtocolViolation {
            exchange: self.exchange,
            detail: detail.to_string(),
        }
    }

    /// Unwrap the `{"code":"0","data":[...]}` REST envelope.
    fn rest_data(&self, value: Value) -> Result<Vec<Value>> {
        let envelope: RestEnvelope = self.from_value(value)?;
        if envelope.code != "0" {
            return Err(IngestError::Rest {
                exchange: self.exchange,
                status: 200,
                body: format!("code {}: {}", envelope.code, envelope.msg),
            });
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl VenueAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn subscribe_frames(&self) -> Vec<Message> {
        let args = self.channel_args();
        if args.is_empty() {
            return Vec::new();
        }
        let frame = serde_json::json!({ "op": "subscribe", "args": args });
        vec![Message::Text(frame.to_string())]
    }

    fn resubscribe_depth_frames(&self, symbol: &str) -> Vec<Message> {
        let arg = serde_json::json!({ "channel": "books", "instId": self.inst_id(symbol) });
        vec![
            Message::Text(
                serde_json::json!({ "op": "unsubscribe", "args": [arg.clone()] }).to_string(),
            ),
            Message::Text(serde_json::json!({ "op": "subscribe", "args": [arg] }).to_string()),
        ]
    }

    fn decode(&self, text: &str) -> Result<Vec<VenueEvent>> {
        if text == "pong" {
            return Ok(vec![VenueEvent::Pong]);
        }
        if text == "ping" {
            // Handled by heartbeat_reply; nothing to surface.
            return Ok(vec![VenueEvent::Ignored]);
        }

        let value: Value = serde_json::from_str(text).map_err(|e| self.violation(&e.to_string()))?;

        if let Some(event) = value.get("event").and_then(Value::as_str) {
            return match event {
                "subscribe" | "unsubscribe" => {
                    let channel = value
                        .pointer("/arg/channel")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    Ok(vec![VenueEvent::SubscriptionAck(channel.to_string())])
                }
                "error" => Err(self.violation(&format!(
                    "subscription error code={} msg={}",
                    value.get("code").and_then(Value::as_str).unwrap_or("?"),
                    value.get("msg").and_then(Value::as_str).unwrap_or("?"),
                ))),
                _ => Ok(vec![VenueEvent::Ignored]),
            };
        }

        let channel = value.pointer("/arg/channel").and_then(Value::as_str);
        let data = match value.get("data").and_then(Value::as_array) {
            Some(data) => data.clone(),
            None => return Ok(vec![VenueEvent::Ignored]),
        };

        match channel {
            Some("trades") => self.decode_trades(data),
            Some("books") => {
                let inst_id = value
                    .pointer("/arg/instId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| self.violation("books message without instId"))?;
                let action = value.get("action").and_then(Value::as_str);
                self.decode_books(action, inst_id, data)
            }
            Some("funding-rate") => self.decode_funding(data),
            Some("open-interest") => self.decode_open_interest(data),
            Some("liquidation-orders") => self.decode_liquidations(data),
            _ => Ok(vec![VenueEvent::Ignored]),
        }
    }

    fn heartbeat_reply(&self, message: &Message) -> Option<Message> {
        match message {
            Message::Text(text) if text == "ping" => Some(Message::Text("pong".to_string())),
            Message::Ping(payload) => Some(Message::Pong(payload.clone())),
            _ => None,
        }
    }

    fn keepalive_frame(&self) -> Option<(Message, Duration)> {
        Some((Message::Text("ping".to_string()), KEEPALIVE_INTERVAL))
    }

    async fn fetch_funding(&self, symbol: &str) -> Result<RawFunding> {
        if !self.is_perpetual() {
            return Err(self.unsupported("funding rate"));
        }
        let url = format!(
            "{}/api/v5/public/funding-rate?instId={}",
            self.rest_url,
            self.inst_id(symbol)
        );
        let value = venue_get(&self.http, &self.limiter, self.exchange, &url, 1).await?;
        let mut events = self.decode_funding(self.rest_data(value)?)?;
        match events.pop() {
            Some(VenueEvent::Funding(funding)) => Ok(funding),
            _ => Err(self.violation("empty funding-rate response")),
        }
    }

    async fn fetch_open_interest(&self, symbol: &str) -> Result<RawOpenInterest> {
        if !self.is_perpetual() {
            return Err(self.unsupported("open interest"));
        }
        let url = format!(
            "{}/api/v5/public/open-interest?instId={}",
            self.rest_url,
            self.inst_id(symbol)
        );
        let value = venue_get(&self.http, &self.limiter, self.exchange, &url, 1).await?;
        let mut events = self.decode_open_interest(self.rest_data(value)?)?;
        match events.pop() {
            Some(VenueEvent::OpenInterest(oi)) => Ok(oi),
            _ => Err(self.violation("empty open-interest response")),
        }
    }

    async fn fetch_long_short_ratio(
        &self,
        symbol: &str,
        variant: LsrVariant,
        period: &str,
    ) -> Result<RawLsr> {
        if !self.is_perpetual() {
            return Err(self.unsupported("long/short ratio"));
        }
        let url = match variant {
            // Top-trader positioning is keyed by instrument.
            LsrVariant::TopPosition => format!(
                "{}/api/v5/rubik/stat/contracts/long-short-position-ratio-contract-top-trader?instId={}&period={}",
                self.rest_url,
                self.inst_id(symbol),
                period
            ),
            // Account-count positioning is keyed by underlying currency.
            LsrVariant::AllAccount => {
                let currency = symbol.split('-').next().unwrap_or(symbol);
                format!(
                    "{}/api/v5/rubik/stat/contracts/long-short-account-ratio?ccy={}&period={}",
                    self.rest_url, currency, period
                )
            }
        };
        let value = venue_get(&self.http, &self.limiter, self.exchange, &url, 1).await?;
        let data = self.rest_data(value)?;
        // Rows are [ts, ratio] pairs, newest first.
        let row: Vec<String> = self.from_value(
            data.into_iter()
                .next()
                .ok_or_else(|| self.violation("empty long/short ratio response"))?,
        )?;
        let ts = row.first().cloned().unwrap_or_default();
        let ratio = row
            .get(1)
            .ok_or_else(|| self.violation("long/short ratio row missing value"))?;
        Ok(RawLsr {
            symbol: self.inst_id(symbol),
            variant,
            ratio: parse_decimal(ratio, self.exchange)?,
            long_pct: None,
            short_pct: None,
            period: period.to_string(),
            event_time_ms: parse_ms(&ts),
        })
    }
}

fn parse_side(raw: &str, exchange: Exchange) -> Result<Side> {
    match raw {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(IngestError::ProtocolViolation {
            exchange,
            detail: format!("unknown side: {other:?}"),
        }),
    }
}

fn parse_ms(raw: &str) -> Option<i64> {
    raw.parse().ok()
}

#[derive(Debug, Deserialize)]
struct RestEnvelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TradeRow {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "tradeId")]
    trade_id: String,
    #[serde(rename = "px")]
    price: String,
    #[serde(rename = "sz")]
    size: String,
    side: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct BookRow {
    #[serde(default)]
    bids: Vec<Vec<String>>,
    #[serde(default)]
    asks: Vec<Vec<String>>,
    ts: String,
    #[serde(rename = "seqId")]
    seq_id: i64,
    #[serde(rename = "prevSeqId", default = "default_prev_seq")]
    prev_seq_id: i64,
    checksum: Option<i32>,
}

fn default_prev_seq() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
struct FundingRow {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "fundingRate")]
    funding_rate: String,
    #[serde(rename = "fundingTime")]
    funding_time: Option<String>,
    #[serde(rename = "nextFundingTime")]
    next_funding_time: Option<String>,
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenInterestRow {
    #[serde(rename = "instId")]
    inst_id: String,
    oi: String,
    #[serde(rename = "oiUsd")]
    oi_usd: Option<String>,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct LiquidationRow {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(default)]
    details: Vec<LiquidationDetail>,
}

#[derive(Debug, Deserialize)]
struct LiquidationDetail {
    side: String,
    #[serde(rename = "bkPx")]
    bankruptcy_price: String,
    #[serde(rename = "sz")]
    size: String,
    ts: String,
}
