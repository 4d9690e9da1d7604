//! Table definitions.
//!
//! One table per record kind, structurally identical in both tiers; only
//! the TTL differs (3 days hot, 365 cold by default). Engine is
//! `ReplacingMergeTree` so at-least-once delivery collapses to unique
//! logical rows on the natural key, which is also the sort key and starts
//! with `(exchange, symbol, timestamp)` for range scans. Partitioning is
//! by month and exchange; time-series columns use `Delta,ZSTD`, the rest
//! plain `ZSTD`.

use types::venue::DataType;

/// `CREATE DATABASE IF NOT EXISTS`.
pub fn create_database_sql(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {database}")
}

/// `CREATE TABLE IF NOT EXISTS` for one record kind.
pub fn create_table_sql(database: &str, data_type: DataType, ttl_days: u32) -> String {
    let table = data_type.table();
    let (columns, order_by) = match data_type {
        DataType::Trade => (
            "    trade_id String CODEC(ZSTD),\n\
             \x20   price Decimal64(8) CODEC(ZSTD),\n\
             \x20   quantity Decimal64(8) CODEC(ZSTD),\n\
             \x20   side LowCardinality(String),\n\
             \x20   is_maker Nullable(UInt8),",
            "(exchange, symbol, timestamp, trade_id)",
        ),
        DataType::OrderBook => (
            "    last_update_id UInt64 CODEC(Delta, ZSTD),\n\
             \x20   best_bid Nullable(Decimal64(8)) CODEC(ZSTD),\n\
             \x20   best_ask Nullable(Decimal64(8)) CODEC(ZSTD),\n\
             \x20   bids String CODEC(ZSTD),\n\
             \x20   asks String CODEC(ZSTD),",
            "(exchange, symbol, timestamp, last_update_id)",
        ),
        DataType::FundingRate => (
            "    funding_rate Decimal64(8) CODEC(ZSTD),\n\
             \x20   funding_time Nullable(DateTime64(3, 'UTC')) CODEC(ZSTD),\n\
             \x20   next_funding_time Nullable(DateTime64(3, 'UTC')) CODEC(ZSTD),",
            "(exchange, symbol, timestamp)",
        ),
        DataType::OpenInterest => (
            "    open_interest Decimal64(8) CODEC(ZSTD),\n\
             \x20   notional_usd Nullable(Decimal64(8)) CODEC(ZSTD),",
            "(exchange, symbol, timestamp)",
        ),
        DataType::Liquidation => (
            "    side LowCardinality(String),\n\
             \x20   price Decimal64(8) CODEC(ZSTD),\n\
             \x20   quantity Decimal64(8) CODEC(ZSTD),\n\
             \x20   liquidation_id Nullable(String) CODEC(ZSTD),",
            "(exchange, symbol, timestamp)",
        ),
        DataType::LongShortRatio => (
            "    variant LowCardinality(String),\n\
             \x20   ratio Decimal64(8) CODEC(ZSTD),\n\
             \x20   long_pct Nullable(Decimal64(8)) CODEC(ZSTD),\n\
             \x20   short_pct Nullable(Decimal64(8)) CODEC(ZSTD),\n\
             \x20   period LowCardinality(String),",
            "(exchange, symbol, variant, timestamp)",
        ),
        DataType::VolatilityIndex => (
            "    value Decimal64(8) CODEC(ZSTD),\n\
             \x20   resolution_secs UInt32,",
            "(exchange, symbol, timestamp)",
        ),
    };

    format!(
        "CREATE TABLE IF NOT EXISTS {database}.{table} (\n\
         \x20   exchange LowCardinality(String),\n\
         \x20   market_type LowCardinality(String),\n\
         \x20   symbol LowCardinality(String),\n\
         {columns}\n\
         \x20   timestamp DateTime64(3, 'UTC') CODEC(Delta, ZSTD),\n\
         \x20   collected_at DateTime64(3, 'UTC') CODEC(Delta, ZSTD)\n\
         ) ENGINE = ReplacingMergeTree\n\
         PARTITION BY (toYYYYMM(timestamp), exchange)\n\
         ORDER BY {order_by}\n\
         TTL toDateTime(timestamp) + INTERVAL {ttl_days} DAY\n\
         SETTINGS index_granularity = 8192"
    )
}
