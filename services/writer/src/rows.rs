//! Canonical records to store rows.
//!
//! Column names here are the store schema; timestamps are rendered in the
//! `DateTime64(3, 'UTC')`-compatible wire format and decimals as strings
//! so the store parses them at full precision.

use serde_json::{json, Value};
use types::records::MarketRecord;
use types::time::format_millis;
use types::venue::DataType;

/// Map a record to its target table and row.
pub fn row_for(record: &MarketRecord) -> (DataType, Value) {
    let data_type = record.data_type();
    let mut row = match record {
        MarketRecord::Trade(t) => json!({
            "trade_id": t.trade_id,
            "price": t.price.to_string(),
            "quantity": t.quantity.to_string(),
            "side": t.side.as_str(),
            "is_maker": t.is_maker.map(u8::from),
        }),
        MarketRecord::OrderBook(b) => json!({
            "last_update_id": b.last_update_id,
            "best_bid": b.best_bid.map(|p| p.to_string()),
            "best_ask": b.best_ask.map(|p| p.to_string()),
            // Depth arrays are stored as JSON text columns.
            "bids": serde_json::to_string(&b.bids).unwrap_or_default(),
            "asks": serde_json::to_string(&b.asks).unwrap_or_default(),
        }),
        MarketRecord::FundingRate(f) => json!({
            "funding_rate": f.funding_rate.to_string(),
            "funding_time": f.funding_time.map(format_millis),
            "next_funding_time": f.next_funding_time.map(format_millis),
        }),
        MarketRecord::OpenInterest(o) => json!({
            "open_interest": o.open_interest.to_string(),
            "notional_usd": o.notional_usd.map(|n| n.to_string()),
        }),
        MarketRecord::Liquidation(l) => json!({
            "side": l.side.as_str(),
            "price": l.price.to_string(),
            "quantity": l.quantity.to_string(),
            "liquidation_id": l.liquidation_id,
        }),
        MarketRecord::LongShortRatio(r) => json!({
            "variant": r.variant.as_str(),
            "ratio": r.ratio.to_string(),
            "long_pct": r.long_pct.map(|p| p.to_string()),
            "short_pct": r.short_pct.map(|p| p.to_string()),
            "period": r.period,
        }),
        MarketRecord::VolatilityIndex(v) => json!({
            "value": v.value.to_string(),
            "resolution_secs": v.resolution_secs,
        }),
    };

    let common = row.as_object_mut().expect("rows are objects");
    common.insert("exchange".into(), json!(record.exchange().as_str()));
    common.insert(
        "market_type".into(),
        json!(record.market_type().as_str()),
    );
    common.insert("symbol".into(), json!(record.symbol()));
    common.insert(
        "timestamp".into(),
        json!(format_millis(record.timestamp())),
    );
    common.insert(
        "collected_at".into(),
        json!(format_millis(record.collected_at())),
    );

    (data_type, row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use types::records::{OrderBookSnapshot, PriceLevel, Side, Trade};
    use types::venue::{Exchange, MarketType};

    fn ts() -> chrono::DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_007).single().unwrap()
    }

    #[test]
    fn trade_rows_carry_store_columns() {
        let record = MarketRecord::Trade(Trade {
            exchange: Exchange::BinanceSpot,
            market_type: MarketType::Spot,
            symbol: "BTC-USDT".to_string(),
            trade_id: "42".to_string(),
            price: dec!(43250.10),
            quantity: dec!(0.004),
            side: Side::Sell,
            is_maker: Some(true),
            timestamp: ts(),
            collected_at: ts(),
        });
        let (data_type, row) = row_for(&record);
        assert_eq!(data_type, DataType::Trade);
        assert_eq!(row["exchange"], "binance_spot");
        assert_eq!(row["symbol"], "BTC-USDT");
        assert_eq!(row["price"], "43250.10");
        assert_eq!(row["side"], "sell");
        assert_eq!(row["is_maker"], 1);
        assert_eq!(row["timestamp"], "2023-11-14 22:13:20.007");
        assert_eq!(row["collected_at"], "2023-11-14 22:13:20.007");
    }

    #[test]
    fn orderbook_rows_embed_depth_as_json_text() {
        let record = MarketRecord::OrderBook(OrderBookSnapshot {
            exchange: Exchange::OkxSpot,
            market_type: MarketType::Spot,
            symbol: "BTC-USDT".to_string(),
            last_update_id: 9,
            bids: vec![PriceLevel::new(dec!(100), dec!(1))],
            asks: vec![PriceLevel::new(dec!(101), dec!(2))],
            best_bid: Some(dec!(100)),
            best_ask: Some(dec!(101)),
            timestamp: ts(),
            collected_at: ts(),
        });
        let (data_type, row) = row_for(&record);
        assert_eq!(data_type, DataType::OrderBook);
        assert_eq!(row["last_update_id"], 9);
        assert_eq!(row["best_bid"], "100");

        let bids: Vec<PriceLevel> =
            serde_json::from_str(row["bids"].as_str().unwrap()).unwrap();
        assert_eq!(bids[0].price, dec!(100));
    }

    #[test]
    fn optional_fields_are_null_not_missing() {
        let record = MarketRecord::Trade(Trade {
            exchange: Exchange::BinanceSpot,
            market_type: MarketType::Spot,
            symbol: "BTC-USDT".to_string(),
            trade_id: "1".to_string(),
            price: dec!(1),
            quantity: dec!(1),
            side: Side::Buy,
            is_maker: None,
            timestamp: ts(),
            collected_at: ts(),
        });
        let (_, row) = row_for(&record);
        assert!(row["is_maker"].is_null());
    }
}
