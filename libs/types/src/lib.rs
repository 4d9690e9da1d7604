//! Canonical types shared by every Riptide service.
//!
//! Everything that crosses a crate boundary lives here: venue and data-type
//! identifiers, the canonical record structs that end up on the bus and in
//! the analytical store, symbol canonicalization, and the UTC-millisecond
//! timestamp conventions.
//!
//! Decimal fields use [`rust_decimal::Decimal`] in memory and serialize as
//! strings, so no price or quantity ever rounds through a float.

pub mod records;
pub mod symbol;
pub mod time;
pub mod venue;

pub use records::{
    FundingRate, Liquidation, LongShortRatio, LsrVariant, MarketRecord, OpenInterest,
    OrderBookSnapshot, PriceLevel, Side, Trade, VolatilityIndex,
};
pub use symbol::canonical_symbol;
pub use venue::{DataType, Exchange, MarketType};

use thiserror::Error;

/// Errors produced while interpreting venue-provided identifiers.
#[derive(Debug, Error)]
pub enum TypeError {
    /// String does not name a known exchange.
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    /// String does not name a known data type.
    #[error("unknown data type: {0}")]
    UnknownDataType(String),

    /// Venue symbol could not be split into base and quote assets.
    #[error("unrecognized symbol format: {0}")]
    UnrecognizedSymbol(String),
}
