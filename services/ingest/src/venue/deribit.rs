//! Deribit adapter.
//!
//! Deribit speaks JSON-RPC 2.0 over both transports. The only data this
//! pipeline collects from it is the volatility index, which is fetched
//! request/response over REST at 60-second resolution, so the WebSocket
//! surface here is minimal: it exists for the heartbeat protocol
//! (`test_request` frames must be answered with `public/test`) and decodes
//! the volatility subscription stream should one be enabled.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use types::venue::Exchange;

use super::{venue_get, RawVolatilityIndex, VenueAdapter, VenueEvent};
use crate::error::{IngestError, Result};
use crate::rate_limit::VenueLimiter;
use config::VenueConfig;

/// Volatility index sample resolution, seconds.
const VOL_RESOLUTION_SECS: u32 = 60;

pub struct DeribitAdapter {
    exchange: Exchange,
    ws_url: String,
    rest_url: String,
    limiter: Arc<VenueLimiter>,
    http: reqwest::Client,
}

impl DeribitAdapter {
    pub fn new(venue: &VenueConfig, limiter: Arc<VenueLimiter>, http: reqwest::Client) -> Self {
        Self {
            exchange: venue.exchange,
            ws_url: venue.ws_url.clone(),
            rest_url: venue.rest_url.clone(),
            limiter,
            http,
        }
    }

    fn violation(&self, detail: &str) -> IngestError {
        IngestError::ProtocolViolation {
            exchange: self.exchange,
            detail: detail.to_string(),
        }
    }

    fn decode_volatility(&self, params: &Value) -> Result<VenueEvent> {
        let data: VolatilityTick = serde_json::from_value(
            params.get("data").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| self.violation(&e.to_string()))?;
        // Channel names look like `deribit_volatility_index.btc_usd`.
        let currency = data
            .index_name
            .split('_')
            .next()
            .unwrap_or(&data.index_name)
            .to_ascii_uppercase();
        Ok(VenueEvent::VolatilityIndex(RawVolatilityIndex {
            currency,
            value: decimal_from_f64(data.volatility, self.exchange)?,
            resolution_secs: VOL_RESOLUTION_SECS,
            event_time_ms: Some(data.timestamp),
        }))
    }
}

#[async_trait]
impl VenueAdapter for DeribitAdapter {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Nothing is streamed from Deribit; the volatility index is polled.
    fn subscribe_frames(&self) -> Vec<Message> {
        Vec::new()
    }

    fn decode(&self, text: &str) -> Result<Vec<VenueEvent>> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| self.violation(&e.to_string()))?;

        match value.get("method").and_then(Value::as_str) {
            Some("subscription") => {
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                let channel = params.get("channel").and_then(Value::as_str).unwrap_or("");
                if channel.starts_with("deribit_volatility_index") {
                    Ok(vec![self.decode_volatility(&params)?])
                } else {
                    Ok(vec![VenueEvent::Ignored])
                }
            }
            // Heartbeats are answered in heartbeat_reply; the frame itself
            // carries no data.
            Some("heartbeat") => Ok(vec![VenueEvent::Ignored]),
            None if value.get("result").is_some() => Ok(vec![VenueEvent::SubscriptionAck(
                value.get("id").map(|id| id.to_string()).unwrap_or_default(),
            )]),
            _ => Ok(vec![VenueEvent::Ignored]),
        }
    }

    fn heartbeat_reply(&self, message: &Message) -> Option<Message> {
        let Message::Text(text) = message else {
            return match message {
                Message::Ping(payload) => Some(Message::Pong(payload.clone())),
                _ => None,
            };
        };
        let value: Value = serde_json::from_str(text).ok()?;
        let is_test_request = value.get("method").and_then(Value::as_str) == Some("heartbeat")
            && value.pointer("/params/type").and_then(Value::as_str) == Some("test_request");
        if is_test_request {
            let reply = serde_json::json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "public/test",
                "params": {},
            });
            Some(Message::Text(reply.to_string()))
        } else {
            None
        }
    }

    async fn fetch_volatility_index(&self, currency: &str) -> Result<RawVolatilityIndex> {
        let end_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        // A few resolution steps of history guarantee at least one sample.
        let start_ms = end_ms - (VOL_RESOLUTION_SECS as i64) * 1000 * 5;
        let url = format!(
            "{}/api/v2/public/get_volatility_index?currency={}&resolution={}&start_timestamp={}&end_timestamp={}",
            self.rest_url, currency, VOL_RESOLUTION_SECS, start_ms, end_ms
        );
        let value = venue_get(&self.http, &self.limiter, self.exchange, &url, 1).await?;
        let result: VolatilityResult = serde_json::from_value(
            value.get("result").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| self.violation(&e.to_string()))?;
        // Candles are [timestamp, open, high, low, close], oldest first.
        let candle = result
            .data
            .last()
            .ok_or_else(|| self.violation("empty volatility index response"))?;
        if candle.len() < 5 {
            return Err(self.violation("short volatility index candle"));
        }
        Ok(RawVolatilityIndex {
            currency: currency.to_ascii_uppercase(),
            value: decimal_from_f64(candle[4], self.exchange)?,
            resolution_secs: VOL_RESOLUTION_SECS,
            event_time_ms: Some(candle[0] as i64),
        })
    }
}

fn decimal_from_f64(value: f64, exchange: Exchange) -> Result<Decimal> {
    Decimal::try_from(value).map_err(|_| IngestError::ProtocolViolation {
        exchange,
        detail: format!("unrepresentable numeric value: {value}"),
    })
}

#[derive(Debug, Deserialize)]
struct VolatilityTick {
    timestamp: i64,
    volatility: f64,
    index_name: String,
}

#[derive(Debug, Deserialize)]
struct VolatilityResult {
    #[serde(default)]
    data: Vec<Vec<f64>>,
}
