//! Venue and data-type identifiers.
//!
//! An [`Exchange`] names one concrete upstream feed (venue + market tier);
//! its wire form (`binance_spot`, `okx_derivatives`, ...) appears in bus
//! subjects, message headers, and store rows, so the mapping here is part
//! of the external contract.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TypeError;

/// Market tier of a venue feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    /// Cash markets.
    Spot,
    /// Perpetual swaps / linear futures.
    Perpetual,
}

impl MarketType {
    /// Wire name used in subjects and headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Perpetual => "perpetual",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete upstream feed.
///
/// Binance and OKX expose spot and derivatives as separate endpoints with
/// different protocols and rate limits, so each tier is its own variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    BinanceSpot,
    BinanceDerivatives,
    OkxSpot,
    OkxDerivatives,
    DeribitDerivatives,
}

impl Exchange {
    /// All feeds the pipeline knows how to speak to.
    pub const ALL: [Exchange; 5] = [
        Exchange::BinanceSpot,
        Exchange::BinanceDerivatives,
        Exchange::OkxSpot,
        Exchange::OkxDerivatives,
        Exchange::DeribitDerivatives,
    ];

    /// Wire name used in subjects, headers, and store rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::BinanceSpot => "binance_spot",
            Exchange::BinanceDerivatives => "binance_derivatives",
            Exchange::OkxSpot => "okx_spot",
            Exchange::OkxDerivatives => "okx_derivatives",
            Exchange::DeribitDerivatives => "deribit_derivatives",
        }
    }

    /// Market tier of this feed.
    pub fn market_type(&self) -> MarketType {
        match self {
            Exchange::BinanceSpot | Exchange::OkxSpot => MarketType::Spot,
            Exchange::BinanceDerivatives
            | Exchange::OkxDerivatives
            | Exchange::DeribitDerivatives => MarketType::Perpetual,
        }
    }

    /// True for the Binance venue family (spot and derivatives share the
    /// diff-stream sequencing protocol).
    pub fn is_binance(&self) -> bool {
        matches!(self, Exchange::BinanceSpot | Exchange::BinanceDerivatives)
    }

    /// True for the OKX venue family (seqId chains + CRC32 checksums).
    pub fn is_okx(&self) -> bool {
        matches!(self, Exchange::OkxSpot | Exchange::OkxDerivatives)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binance_spot" => Ok(Exchange::BinanceSpot),
            "binance_derivatives" => Ok(Exchange::BinanceDerivatives),
            "okx_spot" => Ok(Exchange::OkxSpot),
            "okx_derivatives" => Ok(Exchange::OkxDerivatives),
            "deribit_derivatives" => Ok(Exchange::DeribitDerivatives),
            other => Err(TypeError::UnknownExchange(other.to_string())),
        }
    }
}

/// One canonical record kind.
///
/// Drives subject prefixes, writer batching keys, and store table names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Trade,
    #[serde(rename = "orderbook")]
    OrderBook,
    FundingRate,
    OpenInterest,
    Liquidation,
    LongShortRatio,
    VolatilityIndex,
}

impl DataType {
    /// Every record kind the pipeline carries.
    pub const ALL: [DataType; 7] = [
        DataType::Trade,
        DataType::OrderBook,
        DataType::FundingRate,
        DataType::OpenInterest,
        DataType::Liquidation,
        DataType::LongShortRatio,
        DataType::VolatilityIndex,
    ];

    /// Header / config wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Trade => "trade",
            DataType::OrderBook => "orderbook",
            DataType::FundingRate => "funding_rate",
            DataType::OpenInterest => "open_interest",
            DataType::Liquidation => "liquidation",
            DataType::LongShortRatio => "long_short_ratio",
            DataType::VolatilityIndex => "volatility_index",
        }
    }

    /// First token of the bus subject for this kind.
    pub fn subject_prefix(&self) -> &'static str {
        match self {
            DataType::Trade => "trade-data",
            DataType::OrderBook => "orderbook-data",
            DataType::FundingRate => "funding-rate-data",
            DataType::OpenInterest => "open-interest-data",
            DataType::Liquidation => "liquidation-data",
            DataType::LongShortRatio => "lsr-data",
            DataType::VolatilityIndex => "volatility-index-data",
        }
    }

    /// Analytical-store table name (same in hot and cold databases).
    pub fn table(&self) -> &'static str {
        match self {
            DataType::Trade => "trades",
            DataType::OrderBook => "orderbooks",
            DataType::FundingRate => "funding_rates",
            DataType::OpenInterest => "open_interests",
            DataType::Liquidation => "liquidations",
            DataType::LongShortRatio => "long_short_ratios",
            DataType::VolatilityIndex => "volatility_indices",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" => Ok(DataType::Trade),
            "orderbook" => Ok(DataType::OrderBook),
            "funding_rate" => Ok(DataType::FundingRate),
            "open_interest" => Ok(DataType::OpenInterest),
            "liquidation" => Ok(DataType::Liquidation),
            "long_short_ratio" => Ok(DataType::LongShortRatio),
            "volatility_index" => Ok(DataType::VolatilityIndex),
            other => Err(TypeError::UnknownDataType(other.to_string())),
        }
    }
}
