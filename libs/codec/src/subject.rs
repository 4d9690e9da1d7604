//! Subject templates.
//!
//! Subjects are dot-separated, one hierarchy per record kind:
//!
//! ```text
//! {prefix}.{exchange}.{market_type}.{symbol}
//! lsr-data.{exchange}.{market_type}.{variant}.{symbol}
//! ```
//!
//! The stream binds the wildcard form of each prefix.

use types::records::MarketRecord;
use types::venue::DataType;

/// Name of the JetStream stream all subjects bind to.
pub const STREAM_NAME: &str = "MARKET_DATA";

/// Subject a record publishes under.
pub fn subject_for(record: &MarketRecord) -> String {
    let prefix = record.data_type().subject_prefix();
    let exchange = record.exchange().as_str();
    let market = record.market_type().as_str();
    match record {
        MarketRecord::LongShortRatio(lsr) => format!(
            "{prefix}.{exchange}.{market}.{variant}.{symbol}",
            variant = lsr.variant.as_str(),
            symbol = lsr.symbol,
        ),
        _ => format!(
            "{prefix}.{exchange}.{market}.{symbol}",
            symbol = record.symbol(),
        ),
    }
}

/// Wildcard subject set the stream is provisioned with.
pub fn stream_subjects() -> Vec<String> {
    DataType::ALL
        .iter()
        .map(|dt| format!("{}.>", dt.subject_prefix()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use types::records::{LongShortRatio, LsrVariant, Trade, Side};
    use types::venue::{Exchange, MarketType};

    fn ts() -> chrono::DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap()
    }

    #[test]
    fn trade_subject_template() {
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
        assert_eq!(subject_for(&record), "trade-data.binance_spot.spot.BTC-USDT");
    }

    #[test]
    fn lsr_subject_carries_variant() {
        let record = MarketRecord::LongShortRatio(LongShortRatio {
            variant: LsrVariant::TopPosition,
            exchange: Exchange::OkxDerivatives,
            market_type: MarketType::Perpetual,
            symbol: "ETH-USDT".to_string(),
            ratio: dec!(1.5),
            long_pct: None,
            short_pct: None,
            period: "5m".to_string(),
            timestamp: ts(),
            collected_at: ts(),
        });
        assert_eq!(
            subject_for(&record),
            "lsr-data.okx_derivatives.perpetual.top_position.ETH-USDT"
        );
    }

    #[test]
    fn stream_binds_every_prefix() {
        let subjects = stream_subjects();
        assert_eq!(subjects.len(), 7);
        for expected in [
            "orderbook-data.>",
            "trade-data.>",
            "funding-rate-data.>",
            "open-interest-data.>",
            "liquidation-data.>",
            "lsr-data.>",
            "volatility-index-data.>",
        ] {
            assert!(subjects.iter().any(|s| s == expected), "missing {expected}");
        }
    }
}
