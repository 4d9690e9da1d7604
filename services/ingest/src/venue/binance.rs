//! Binance adapter, covering spot and USD-M derivatives.
//!
//! Both tiers share the JSON stream dialect: combined subscriptions via a
//! `SUBSCRIBE` frame, unsolicited WebSocket pings that must be answered
//! with matching pongs, and depth diffs carrying `U`/`u` first/last update
//! ids (`pu` chain on derivatives). Book recovery is a REST depth snapshot
//! joined against buffered diffs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use types::records::{LsrVariant, Side};
use types::symbol::concat_form;
use types::venue::{DataType, Exchange};

use super::{
    parse_decimal, venue_get, RawBookDiff, RawFunding, RawLiquidation, RawLsr, RawOpenInterest,
    RawTrade, VenueAdapter, VenueEvent,
};
use crate::error::{IngestError, Result};
use crate::rate_limit::VenueLimiter;
use config::VenueConfig;

/// Levels requested in the recovery snapshot; must cover collection depth.
const SNAPSHOT_LIMIT: usize = 1000;

pub struct BinanceAdapter {
    exchange: Exchange,
    ws_url: String,
    rest_url: String,
    symbols: Vec<String>,
    data_types: Vec<DataType>,
    limiter: Arc<VenueLimiter>,
    http: reqwest::Client,
}

impl BinanceAdapter {
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

    fn is_derivatives(&self) -> bool {
        self.exchange == Exchange::BinanceDerivatives
    }

    /// Stream names for one canonical symbol, e.g. `btcusdt@depth@100ms`.
    fn stream_names(&self, canonical: &str) -> Vec<String> {
        let venue_symbol = concat_form(canonical).to_ascii_lowercase();
        let mut streams = Vec::new();
        for data_type in &self.data_types {
            match data_type {
                DataType::Trade => streams.push(format!("{venue_symbol}@trade")),
                DataType::OrderBook => streams.push(format!("{venue_symbol}@depth@100ms")),
                DataType::FundingRate if self.is_derivatives() => {
                    streams.push(format!("{venue_symbol}@markPrice"))
                }
                DataType::Liquidation if self.is_derivatives() => {
                    streams.push(format!("{venue_symbol}@forceOrder"))
                }
                // Open interest and LSR have no stream; the poller covers
                // them.
                _ => {}
            }
        }
        streams
    }

    fn decode_trade(&self, value: Value) -> Result<VenueEvent> {
        let event: TradeEvent = self.from_value(value)?;
        let side = if event.buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        };
        Ok(VenueEvent::Trade(RawTrade {
            symbol: event.symbol,
            trade_id: event.trade_id.to_string(),
            price: parse_decimal(&event.price, self.exchange)?,
            quantity: parse_decimal(&event.quantity, self.exchange)?,
            side,
            is_maker: Some(event.buyer_is_maker),
            event_time_ms: Some(event.trade_time),
        }))
    }

    fn decode_depth(&self, value: Value) -> Result<VenueEvent> {
        let event: DepthEvent = self.from_value(value)?;
        Ok(VenueEvent::BookDiff(RawBookDiff {
            symbol: event.symbol,
            first_update_id: event.first_update_id,
            last_update_id: event.last_update_id,
            prev_update_id: event.prev_update_id,
            is_snapshot: false,
            bids: self.decode_levels(event.bids)?,
            asks: self.decode_levels(event.asks)?,
            checksum: None,
            event_time_ms: Some(event.event_time),
        }))
    }

    fn decode_mark_price(&self, value: Value) -> Result<VenueEvent> {
        let event: MarkPriceEvent = self.from_value(value)?;
        Ok(VenueEvent::Funding(RawFunding {
            symbol: event.symbol,
            rate: parse_decimal(&event.funding_rate, self.exchange)?,
            funding_time_ms: None,
            next_funding_time_ms: Some(event.next_funding_time),
            event_time_ms: Some(event.event_time),
        }))
    }

    fn decode_force_order(&self, value: Value) -> Result<VenueEvent> {
        let event: ForceOrderEvent = self.from_value(value)?;
        let order = event.order;
        let side = match order.side.as_str() {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            other => {
                return Err(IngestError::ProtocolViolation {
                    exchange: self.exchange,
                    detail: format!("unknown liquidation side: {other:?}"),
                })
            }
        };
        let price = if order.average_price.is_empty() || order.average_price == "0" {
            &order.price
        } else {
            &order.average_price
        };
        Ok(VenueEvent::Liquidation(RawLiquidation {
            symbol: order.symbol,
            side,
            price: parse_decimal(price, self.exchange)?,
            quantity: parse_decimal(&order.quantity, self.exchange)?,
            liquidation_id: None,
            event_time_ms: Some(order.trade_time),
        }))
    }

    fn decode_levels(&self, raw: Vec<[String; 2]>) -> Result<Vec<(rust_decimal::Decimal, rust_decimal::Decimal)>> {
        raw.into_iter()
            .map(|[price, quantity]| {
                Ok((
                    parse_decimal(&price, self.exchange)?,
                    parse_decimal(&quantity, self.exchange)?,
                ))
            })
            .collect()
    }

    fn from_value<T: serde::de::DeserializeOwned>(&self, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| IngestError::ProtocolViolation {
            exchange: self.exchange,
            detail: e.to_string(),
        })
    }

    fn rest_path(&self, spot: &'static str, derivatives: &'static str) -> &'static str {
        if self.is_derivatives() {
            derivatives
        } else {
            spot
        }
    }
}

#[async_trait]
impl VenueAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn subscribe_frames(&self) -> Vec<Message> {
        let params: Vec<String> = self
            .symbols
            .iter()
            .flat_map(|symbol| self.stream_names(symbol))
            .collect();
        if params.is_empty() {
            return Vec::new();
        }
        let frame = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": 1,
        });
        vec![Message::Text(frame.to_string())]
    }

    fn decode(&self, text: &str) -> Result<Vec<VenueEvent>> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| IngestError::ProtocolViolation {
                exchange: self.exchange,
                detail: e.to_string(),
            })?;

        let event = match value.get("e").and_then(Value::as_str) {
            Some("trade") => self.decode_trade(value)?,
            Some("depthUpdate") => self.decode_depth(value)?,
            Some("markPriceUpdate") => self.decode_mark_price(value)?,
            Some("forceOrder") => self.decode_force_order(value)?,
            Some(_) => VenueEvent::Ignored,
            None if value.get("result").is_some() => {
                VenueEvent::SubscriptionAck(value.get("id").map(|id| id.to_string()).unwrap_or_default())
            }
            None => VenueEvent::Ignored,
        };
        Ok(vec![event])
    }

    fn heartbeat_reply(&self, message: &Message) -> Option<Message> {
        match message {
            // Venue timeout demands the pong carry the ping payload back.
            Message::Ping(payload) => Some(Message::Pong(payload.clone())),
            _ => None,
        }
    }

    async fn fetch_book_snapshot(&self, symbol: &str) -> Result<RawBookDiff> {
        let path = self.rest_path("/api/v3/depth", "/fapi/v1/depth");
        let weight = if self.is_derivatives() { 20 } else { 50 };
        let url = format!(
            "{}{}?symbol={}&limit={}",
            self.rest_url,
            path,
            concat_form(symbol),
            SNAPSHOT_LIMIT
        );
        let value = venue_get(&self.http, &self.limiter, self.exchange, &url, weight).await?;
        let snapshot: DepthSnapshot = self.from_value(value)?;
        Ok(RawBookDiff {
            symbol: concat_form(symbol),
            first_update_id: snapshot.last_update_id,
            last_update_id: snapshot.last_update_id,
            prev_update_id: None,
            is_snapshot: true,
            bids: self.decode_levels(snapshot.bids)?,
            asks: self.decode_levels(snapshot.asks)?,
            checksum: None,
            event_time_ms: None,
        })
    }

    async fn fetch_funding(&self, symbol: &str) -> Result<RawFunding> {
        if !self.is_derivatives() {
            return Err(self.unsupported("funding rate"));
        }
        let url = format!(
            "{}/fapi/v1/premiumIndex?symbol={}",
            self.rest_url,
            concat_form(symbol)
        );
        let value = venue_get(&self.http, &self.limiter, self.exchange, &url, 1).await?;
        let index: PremiumIndex = self.from_value(value)?;
        Ok(RawFunding {
            symbol: index.symbol,
            rate: parse_decimal(&index.last_funding_rate, self.exchange)?,
            funding_time_ms: None,
            next_funding_time_ms: Some(index.next_funding_time),
            event_time_ms: Some(index.time),
        })
    }

    async fn fetch_open_interest(&self, symbol: &str) -> Result<RawOpenInterest> {
        if !self.is_derivatives() {
            return Err(self.unsupported("open interest"));
        }
        let url = format!(
            "{}/fapi/v1/openInterest?symbol={}",
            self.rest_url,
            concat_form(symbol)
        );
        let value = venue_get(&self.http, &self.limiter, self.exchange, &url, 1).await?;
        let oi: OpenInterestResponse = self.from_value(value)?;
        Ok(RawOpenInterest {
            symbol: oi.symbol,
            open_interest: parse_decimal(&oi.open_interest, self.exchange)?,
            notional_usd: None,
            event_time_ms: oi.time,
        })
    }

    async fn fetch_long_short_ratio(
        &self,
        symbol: &str,
        variant: LsrVariant,
        period: &str,
    ) -> Result<RawLsr> {
        if !self.is_derivatives() {
            return Err(self.unsupported("long/short ratio"));
        }
        let path = match variant {
            LsrVariant::TopPosition => "/futures/data/topLongShortPositionRatio",
            LsrVariant::AllAccount => "/futures/data/globalLongShortAccountRatio",
        };
        let url = format!(
            "{}{}?symbol={}&period={}&limit=1",
            self.rest_url,
            path,
            concat_form(symbol),
            period
        );
        let value = venue_get(&self.http, &self.limiter, self.exchange, &url, 1).await?;
        let mut rows: Vec<LsrRow> = self.from_value(value)?;
        let row = rows.pop().ok_or_else(|| IngestError::ProtocolViolation {
            exchange: self.exchange,
            detail: "empty long/short ratio response".to_string(),
        })?;
        Ok(RawLsr {
            symbol: row.symbol,
            variant,
            ratio: parse_decimal(&row.long_short_ratio, self.exchange)?,
            long_pct: parse_decimal(&row.long_account, self.exchange).ok(),
            short_pct: parse_decimal(&row.short_account, self.exchange).ok(),
            period: period.to_string(),
            event_time_ms: Some(row.timestamp),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TradeEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "t")]
    trade_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
struct DepthEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    last_update_id: u64,
    /// Derivatives-only chain link to the previous event's `u`.
    #[serde(rename = "pu")]
    prev_update_id: Option<u64>,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct MarkPriceEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "r")]
    funding_rate: String,
    #[serde(rename = "T")]
    next_funding_time: i64,
}

#[derive(Debug, Deserialize)]
struct ForceOrderEvent {
    #[serde(rename = "o")]
    order: ForceOrderDetail,
}

#[derive(Debug, Deserialize)]
struct ForceOrderDetail {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "ap", default)]
    average_price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepthSnapshot {
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    symbol: String,
    last_funding_rate: String,
    next_funding_time: i64,
    time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenInterestResponse {
    symbol: String,
    open_interest: String,
    time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LsrRow {
    symbol: String,
    long_short_ratio: String,
    long_account: String,
    short_account: String,
    timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::default_venues;
    use rust_decimal_macros::dec;

    fn adapter(exchange: Exchange) -> BinanceAdapter {
        let venue = default_venues()
            .into_iter()
            .find(|v| v.exchange == exchange)
            .unwrap();
        let limiter = Arc::new(VenueLimiter::new(exchange, &venue.rate_limit));
        BinanceAdapter::new(&venue, limiter, reqwest::Client::new())
    }

    #[test]
    fn subscribe_frame_lists_configured_streams() {
        let adapter = adapter(Exchange::BinanceSpot);
        let frames = adapter.subscribe_frames();
        assert_eq!(frames.len(), 1);
        let Message::Text(body) = &frames[0] else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(body).unwrap();
        assert_eq!(value["method"], "SUBSCRIBE");
        let params: Vec<&str> = value["params"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p.as_str().unwrap())
            .collect();
        assert!(params.contains(&"btcusdt@trade"));
        assert!(params.contains(&"btcusdt@depth@100ms"));
        // Spot has no derivatives-only streams.
        assert!(!params.iter().any(|p| p.ends_with("@markPrice")));
    }

    #[test]
    fn derivatives_subscribe_adds_funding_and_liquidations() {
        let adapter = adapter(Exchange::BinanceDerivatives);
        let frames = adapter.subscribe_frames();
        let Message::Text(body) = &frames[0] else {
            panic!("expected text frame");
        };
        assert!(body.contains("@markPrice"));
        assert!(body.contains("@forceOrder"));
    }

    #[test]
    fn decodes_trade_with_taker_side() {
        let adapter = adapter(Exchange::BinanceSpot);
        let frame = r#"{"e":"trade","E":1700000000100,"s":"BTCUSDT","t":12345,
            "p":"43250.10","q":"0.004","T":1700000000099,"m":true,"M":true}"#;
        let events = adapter.decode(frame).unwrap();
        let VenueEvent::Trade(trade) = &events[0] else {
            panic!("expected trade");
        };
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.trade_id, "12345");
        assert_eq!(trade.price, dec!(43250.10));
        // Buyer was the maker, so the taker sold.
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.event_time_ms, Some(1_700_000_000_099));
    }

    #[test]
    fn decodes_depth_update_ids() {
        let adapter = adapter(Exchange::BinanceSpot);
        let frame = r#"{"e":"depthUpdate","E":1700000000100,"s":"BTCUSDT",
            "U":157,"u":160,"b":[["43250.00","0.5"],["43249.00","0"]],"a":[["43251.00","1.2"]]}"#;
        let events = adapter.decode(frame).unwrap();
        let VenueEvent::BookDiff(diff) = &events[0] else {
            panic!("expected book diff");
        };
        assert_eq!(diff.first_update_id, 157);
        assert_eq!(diff.last_update_id, 160);
        assert_eq!(diff.prev_update_id, None);
        assert!(!diff.is_snapshot);
        assert_eq!(diff.bids.len(), 2);
        assert_eq!(diff.bids[1].1, dec!(0));
    }

    #[test]
    fn derivatives_depth_carries_pu_chain() {
        let adapter = adapter(Exchange::BinanceDerivatives);
        let frame = r#"{"e":"depthUpdate","E":1700000000100,"T":1700000000099,"s":"BTCUSDT",
            "U":200,"u":205,"pu":199,"b":[],"a":[]}"#;
        let events = adapter.decode(frame).unwrap();
        let VenueEvent::BookDiff(diff) = &events[0] else {
            panic!("expected book diff");
        };
        assert_eq!(diff.prev_update_id, Some(199));
    }

    #[test]
    fn decodes_mark_price_as_funding() {
        let adapter = adapter(Exchange::BinanceDerivatives);
        let frame = r#"{"e":"markPriceUpdate","E":1700000000100,"s":"BTCUSDT",
            "p":"43255.1","r":"0.00010000","T":1700028800000}"#;
        let events = adapter.decode(frame).unwrap();
        let VenueEvent::Funding(funding) = &events[0] else {
            panic!("expected funding");
        };
        assert_eq!(funding.rate, dec!(0.00010000));
        assert_eq!(funding.next_funding_time_ms, Some(1_700_028_800_000));
    }

    #[test]
    fn decodes_force_order_as_liquidation() {
        let adapter = adapter(Exchange::BinanceDerivatives);
        let frame = r#"{"e":"forceOrder","E":1700000000100,"o":{"s":"BTCUSDT","S":"SELL",
            "o":"LIMIT","q":"0.014","p":"43000.00","ap":"43001.50","T":1700000000090}}"#;
        let events = adapter.decode(frame).unwrap();
        let VenueEvent::Liquidation(liq) = &events[0] else {
            panic!("expected liquidation");
        };
        assert_eq!(liq.side, Side::Sell);
        assert_eq!(liq.price, dec!(43001.50));
        assert_eq!(liq.quantity, dec!(0.014));
    }

    #[test]
    fn subscription_ack_and_unknown_events() {
        let adapter = adapter(Exchange::BinanceSpot);
        let events = adapter.decode(r#"{"result":null,"id":1}"#).unwrap();
        assert!(matches!(events[0], VenueEvent::SubscriptionAck(_)));

        let events = adapter.decode(r#"{"e":"24hrTicker","s":"BTCUSDT"}"#).unwrap();
        assert!(matches!(events[0], VenueEvent::Ignored));
    }

    #[test]
    fn garbage_is_a_protocol_violation() {
        let adapter = adapter(Exchange::BinanceSpot);
        assert!(matches!(
            adapter.decode("not json"),
            Err(IngestError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn ping_frames_get_matching_pongs() {
        let adapter = adapter(Exchange::BinanceSpot);
        let reply = adapter.heartbeat_reply(&Message::Ping(vec![1, 2, 3]));
        assert_eq!(reply, Some(Message::Pong(vec![1, 2, 3])));
        assert_eq!(adapter.heartbeat_reply(&Message::Text("x".into())), None);
    }
}
