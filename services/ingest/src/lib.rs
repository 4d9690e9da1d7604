//! Market-data ingestion service.
//!
//! Venue adapters decode exchange streams into raw events; per-symbol
//! order-book managers maintain synchronized books and emit top-N
//! snapshots; a rate-governed poller covers the REST-only data types;
//! the normalizer and publisher put everything on the bus exactly once
//! per fingerprint window.

pub mod connection;
pub mod dedup;
pub mod error;
pub mod normalize;
pub mod orderbook;
pub mod poller;
pub mod publish;
pub mod rate_limit;
pub mod rotation;
pub mod supervisor;
pub mod venue;

pub use error::{IngestError, Result};
