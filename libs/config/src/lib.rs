//! Riptide pipeline configuration.
//!
//! One TOML file configures every service; each binary deserializes the
//! whole [`PipelineConfig`] and reads its slice. Values resolve in three
//! layers: struct defaults, then the TOML file, then `RIPTIDE__`-prefixed
//! environment variables (`RIPTIDE__BUS__URL=nats://...`).
//!
//! Misconfiguration is fatal at startup: [`PipelineConfig::load`] runs
//! [`PipelineConfig::validate`] and the caller exits non-zero on error.

use std::path::{Path, PathBuf};

use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::venue::{DataType, Exchange};

/// Configuration errors, all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] config_crate::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root of the pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub log: LogConfig,
    pub bus: BusConfig,
    pub storage: StorageConfig,
    pub venues: Vec<VenueConfig>,
    pub orderbook: OrderBookConfig,
    pub poller: PollerConfig,
    pub publisher: PublisherConfig,
    pub writer: WriterConfig,
    pub replicator: ReplicatorConfig,
    pub health: HealthConfig,
    pub limits: RuntimeLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            bus: BusConfig::default(),
            storage: StorageConfig::default(),
            venues: default_venues(),
            orderbook: OrderBookConfig::default(),
            poller: PollerConfig::default(),
            publisher: PublisherConfig::default(),
            writer: WriterConfig::default(),
            replicator: ReplicatorConfig::default(),
            health: HealthConfig::default(),
            limits: RuntimeLimits::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from an optional TOML file plus environment overrides, then
    /// validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("RIPTIDE")
                .separator("__")
                .try_parsing(true),
        );
        let config: PipelineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.venues.is_empty() {
            return Err(ConfigError::Invalid("no venues configured".into()));
        }
        for venue in &self.venues {
            if venue.symbols.is_empty() && !venue.data_types.contains(&DataType::VolatilityIndex) {
                return Err(ConfigError::Invalid(format!(
                    "venue {} has no symbols",
                    venue.exchange
                )));
            }
            if venue.rate_limit.capacity == 0 || venue.rate_limit.refill_per_sec == 0 {
                return Err(ConfigError::Invalid(format!(
                    "venue {} has a zero rate limit",
                    venue.exchange
                )));
            }
        }
        if self.orderbook.publish_depth > self.orderbook.collection_depth {
            return Err(ConfigError::Invalid(format!(
                "publish depth {} exceeds collection depth {}",
                self.orderbook.publish_depth, self.orderbook.collection_depth
            )));
        }
        if self.orderbook.publish_depth == 0 {
            return Err(ConfigError::Invalid("publish depth must be positive".into()));
        }
        if self.replicator.batch_hours == 0 {
            return Err(ConfigError::Invalid(
                "replicator batch window must be positive".into(),
            ));
        }
        if self.publisher.batch_size == 0 {
            return Err(ConfigError::Invalid("publisher batch size must be positive".into()));
        }
        Ok(())
    }

    /// Venue entry for an exchange, if configured.
    pub fn venue(&self, exchange: Exchange) -> Option<&VenueConfig> {
        self.venues.iter().find(|v| v.exchange == exchange)
    }
}

/// Logging setup shared by every binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` env-filter directive, e.g. `info,ingest=debug`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// JetStream connection and stream limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub url: String,
    pub stream: String,
    pub max_msgs: i64,
    pub max_bytes: i64,
    pub max_age_hours: u64,
    pub duplicate_window_secs: u64,
    pub publish_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream: "MARKET_DATA".to_string(),
            max_msgs: 5_000_000,
            max_bytes: 2 * 1024 * 1024 * 1024,
            max_age_hours: 48,
            duplicate_window_secs: 120,
            publish_timeout_secs: 5,
        }
    }
}

/// One ClickHouse endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    /// HTTP interface, e.g. `http://127.0.0.1:8123`.
    pub url: String,
    /// Native-protocol address other instances use to reach this one via
    /// `remote()`.
    pub native_addr: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8123".to_string(),
            native_addr: "127.0.0.1:9000".to_string(),
            database: "riptide_hot".to_string(),
            user: None,
            password: None,
            timeout_secs: 10,
        }
    }
}

/// Hot and cold store tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub hot: ClickHouseConfig,
    pub cold: ClickHouseConfig,
    /// Hot-tier TTL in days.
    pub hot_ttl_days: u32,
    /// Cold-tier TTL in days.
    pub cold_ttl_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            hot: ClickHouseConfig::default(),
            cold: ClickHouseConfig {
                url: "http://127.0.0.1:8124".to_string(),
                native_addr: "127.0.0.1:9001".to_string(),
                database: "riptide_cold".to_string(),
                ..ClickHouseConfig::default()
            },
            hot_ttl_days: 3,
            cold_ttl_days: 365,
        }
    }
}

/// One upstream feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub exchange: Exchange,
    pub ws_url: String,
    pub rest_url: String,
    /// Canonical symbols to subscribe (`BTC-USDT`); venue forms are derived.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Volatility-index currencies (Deribit).
    #[serde(default)]
    pub currencies: Vec<String>,
    pub data_types: Vec<DataType>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Connection considered stalled after this much silence.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    60
}

/// Token-bucket sizing for venue REST weight budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity in weight units.
    pub capacity: u32,
    /// Refill rate, weight units per second.
    pub refill_per_sec: u32,
    /// Cap on the adaptive penalty window after 429/418.
    pub penalty_cap_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 1200,
            refill_per_sec: 20,
            penalty_cap_secs: 60,
        }
    }
}

/// Proactive dual-connection rotation ahead of venue 24 h cutoffs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub enabled: bool,
    /// Connection age at which the replacement connection opens.
    pub rotate_after_secs: u64,
    /// Maximum overlap during which both connections run.
    pub overlap_secs: u64,
    /// Bounded per-stream dedup set of venue-native ids.
    pub dedup_capacity: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // 23 h 55 m: ahead of the 24 h unilateral close.
            rotate_after_secs: 23 * 3600 + 55 * 60,
            overlap_secs: 300,
            dedup_capacity: 1000,
        }
    }
}

/// Order-book engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderBookConfig {
    /// Levels kept per side in the local book.
    pub collection_depth: usize,
    /// Levels per side in published snapshots.
    pub publish_depth: usize,
    pub snapshot_interval_ms: u64,
    /// Bounded diff channel per symbol; a full channel backpressures the
    /// reader.
    pub channel_capacity: usize,
    /// Consecutive checksum mismatches before a resync.
    pub checksum_failure_threshold: u32,
    /// Consecutive failed resyncs before the symbol is marked degraded.
    pub max_consecutive_resyncs: u32,
    pub resync_backoff_initial_ms: u64,
    pub resync_backoff_cap_ms: u64,
    /// Book states idle this long are evicted.
    pub idle_eviction_secs: u64,
    /// Global cap on live book states.
    pub max_live_symbols: usize,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            collection_depth: 400,
            publish_depth: 20,
            snapshot_interval_ms: 1000,
            channel_capacity: 1000,
            checksum_failure_threshold: 3,
            max_consecutive_resyncs: 5,
            resync_backoff_initial_ms: 1000,
            resync_backoff_cap_ms: 60_000,
            idle_eviction_secs: 3600,
            max_live_symbols: 1000,
        }
    }
}

/// REST polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub funding_interval_secs: u64,
    pub open_interest_interval_secs: u64,
    pub lsr_interval_secs: u64,
    /// Aggregation period requested from the venue for LSR.
    pub lsr_period: String,
    pub vol_index_interval_secs: u64,
    /// Retries per tick on 5xx before the tick is skipped.
    pub retry_attempts: u32,
    pub request_timeout_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            funding_interval_secs: 300,
            open_interest_interval_secs: 300,
            lsr_interval_secs: 300,
            lsr_period: "5m".to_string(),
            vol_index_interval_secs: 60,
            retry_attempts: 3,
            request_timeout_secs: 30,
        }
    }
}

/// Publisher batching, dedup, and overload behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub batch_size: usize,
    pub linger_secs: u64,
    /// Bounded inbound queue; overflow drops oldest.
    pub queue_capacity: usize,
    pub dedup_ttl_secs: u64,
    pub dedup_capacity: usize,
    /// Per-record retry backoff schedule, milliseconds.
    pub retry_backoff_ms: Vec<u64>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            linger_secs: 5,
            queue_capacity: 10_000,
            dedup_ttl_secs: 120,
            dedup_capacity: 100_000,
            retry_backoff_ms: vec![200, 500, 1000],
        }
    }
}

/// One writer batch class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchPolicy {
    pub max_size: usize,
    pub max_latency_secs: u64,
    pub max_queue: usize,
}

/// Hot-writer batching per traffic class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub durable_name: String,
    /// Orderbooks and trades.
    pub high_frequency: BatchPolicy,
    /// Funding, open interest, liquidations.
    pub mid_frequency: BatchPolicy,
    /// LSR and volatility indices.
    pub low_frequency: BatchPolicy,
    pub retry_attempts: u32,
    pub error_log_path: PathBuf,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            durable_name: "riptide-hot-writer".to_string(),
            high_frequency: BatchPolicy {
                max_size: 100,
                max_latency_secs: 10,
                max_queue: 1000,
            },
            mid_frequency: BatchPolicy {
                max_size: 50,
                max_latency_secs: 5,
                max_queue: 500,
            },
            low_frequency: BatchPolicy {
                max_size: 1,
                max_latency_secs: 1,
                max_queue: 50,
            },
            retry_attempts: 3,
            error_log_path: PathBuf::from("riptide-writer-errors.jsonl"),
        }
    }
}

impl WriterConfig {
    /// Batch policy for a record kind.
    pub fn policy(&self, data_type: DataType) -> BatchPolicy {
        match data_type {
            DataType::OrderBook | DataType::Trade => self.high_frequency,
            DataType::FundingRate | DataType::OpenInterest | DataType::Liquidation => {
                self.mid_frequency
            }
            DataType::LongShortRatio | DataType::VolatilityIndex => self.low_frequency,
        }
    }
}

/// Hot -> cold replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    pub interval_hours: u64,
    /// Window size per run, per table.
    pub batch_hours: u64,
    /// Rows newer than this stay out of the window (hot writes settle).
    pub safety_margin_secs: u64,
    pub cleanup_enabled: bool,
    /// Replicated hot rows become deletable this long after the window end.
    pub cleanup_grace_hours: u64,
    pub watermark_path: PathBuf,
    /// Tables to replicate; defaults to every record kind.
    pub tables: Vec<String>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            batch_hours: 24,
            safety_margin_secs: 300,
            cleanup_enabled: false,
            cleanup_grace_hours: 48,
            watermark_path: PathBuf::from("riptide-replicator-watermarks.json"),
            tables: DataType::ALL.iter().map(|dt| dt.table().to_string()).collect(),
        }
    }
}

/// Health/stats HTTP ports per service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub ingest_port: u16,
    pub writer_port: u16,
    pub replicator_port: u16,
    pub check_interval_secs: u64,
    /// Degraded symbols at or above this count degrade the service.
    pub degraded_symbol_threshold: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ingest_port: 8086,
            writer_port: 8087,
            replicator_port: 8088,
            check_interval_secs: 30,
            degraded_symbol_threshold: 5,
        }
    }
}

/// Process-level resource guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLimits {
    pub memory_check_secs: u64,
    pub memory_log_rss_mb: u64,
    /// Per-worker drain budget at shutdown.
    pub shutdown_drain_secs: u64,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            memory_check_secs: 60,
            memory_log_rss_mb: 512,
            shutdown_drain_secs: 5,
        }
    }
}

/// Built-in venue set: Binance spot + USD-M derivatives, OKX spot + swaps,
/// Deribit volatility indices.
pub fn default_venues() -> Vec<VenueConfig> {
    vec![
        VenueConfig {
            exchange: Exchange::BinanceSpot,
            ws_url: "wss://stream.binance.com:9443/ws".to_string(),
            rest_url: "https://api.binance.com".to_string(),
            symbols: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            currencies: vec![],
            data_types: vec![DataType::Trade, DataType::OrderBook],
            rate_limit: RateLimitConfig::default(),
            rotation: RotationConfig::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        },
        VenueConfig {
            exchange: Exchange::BinanceDerivatives,
            ws_url: "wss://fstream.binance.com/ws".to_string(),
            rest_url: "https://fapi.binance.com".to_string(),
            symbols: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            currencies: vec![],
            data_types: vec![
                DataType::Trade,
                DataType::OrderBook,
                DataType::FundingRate,
                DataType::OpenInterest,
                DataType::Liquidation,
                DataType::LongShortRatio,
            ],
            rate_limit: RateLimitConfig {
                capacity: 2400,
                refill_per_sec: 40,
                penalty_cap_secs: 60,
            },
            rotation: RotationConfig::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        },
        VenueConfig {
            exchange: Exchange::OkxSpot,
            ws_url: "wss://ws.okx.com:8443/ws/v5/public".to_string(),
            rest_url: "https://www.okx.com".to_string(),
            symbols: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            currencies: vec![],
            data_types: vec![DataType::Trade, DataType::OrderBook],
            rate_limit: RateLimitConfig {
                capacity: 600,
                refill_per_sec: 10,
                penalty_cap_secs: 60,
            },
            rotation: RotationConfig::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        },
        VenueConfig {
            exchange: Exchange::OkxDerivatives,
            ws_url: "wss://ws.okx.com:8443/ws/v5/public".to_string(),
            rest_url: "https://www.okx.com".to_string(),
            symbols: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            currencies: vec![],
            data_types: vec![
                DataType::Trade,
                DataType::OrderBook,
                DataType::FundingRate,
                DataType::OpenInterest,
                DataType::Liquidation,
                DataType::LongShortRatio,
            ],
            rate_limit: RateLimitConfig {
                capacity: 600,
                refill_per_sec: 10,
                penalty_cap_secs: 60,
            },
            rotation: RotationConfig::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        },
        VenueConfig {
            exchange: Exchange::DeribitDerivatives,
            ws_url: "wss://www.deribit.com/ws/api/v2".to_string(),
            rest_url: "https://www.deribit.com".to_string(),
            symbols: vec![],
            currencies: vec!["BTC".to_string(), "ETH".to_string()],
            data_types: vec![DataType::VolatilityIndex],
            rate_limit: RateLimitConfig {
                capacity: 100,
                refill_per_sec: 5,
                penalty_cap_secs: 60,
            },
            rotation: RotationConfig {
                enabled: false,
                ..RotationConfig::default()
            },
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        },
    ]
}
