//! Bus envelope codec.
//!
//! Maps canonical records onto the wire contract of the persistent bus:
//! the hierarchical subject a record publishes under, the headers carried
//! alongside it, the JSON payload itself, and the fingerprint the publisher
//! dedups on. Producers (ingest) and consumers (writer) both depend on this
//! crate so the contract has exactly one definition.

pub mod envelope;
pub mod fingerprint;
pub mod subject;

pub use envelope::{decode_record, encode_record, Envelope, HEADER_DATA_TYPE, HEADER_EXCHANGE,
    HEADER_MARKET_TYPE, HEADER_SCHEMA_VERSION, HEADER_SYMBOL, SCHEMA_VERSION};
pub use fingerprint::fingerprint;
pub use subject::{stream_subjects, subject_for, STREAM_NAME};

use thiserror::Error;

/// Errors crossing the envelope boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload was not valid JSON for the expected record shape.
    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}
