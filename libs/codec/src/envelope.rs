//! Record envelope: headers + JSON payload.

use types::records::MarketRecord;

use crate::subject::subject_for;
use crate::CodecError;

/// Version stamped on every published message. Bump on any breaking change
/// to the canonical record schema.
pub const SCHEMA_VERSION: &str = "1.0";

pub const HEADER_EXCHANGE: &str = "exchange";
pub const HEADER_MARKET_TYPE: &str = "market_type";
pub const HEADER_DATA_TYPE: &str = "data_type";
pub const HEADER_SYMBOL: &str = "symbol";
pub const HEADER_SCHEMA_VERSION: &str = "schema-version";

/// A record ready for the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub subject: String,
    /// Header name/value pairs; transport-agnostic so the bus layer maps
    /// them onto its own header type.
    pub headers: Vec<(&'static str, String)>,
    pub payload: Vec<u8>,
}

/// Encode a record into its envelope.
pub fn encode_record(record: &MarketRecord) -> Result<Envelope, CodecError> {
    let payload = serde_json::to_vec(record)?;
    let headers = vec![
        (HEADER_EXCHANGE, record.exchange().as_str().to_string()),
        (HEADER_MARKET_TYPE, record.market_type().as_str().to_string()),
        (HEADER_DATA_TYPE, record.data_type().as_str().to_string()),
        (HEADER_SYMBOL, record.symbol().to_string()),
        (HEADER_SCHEMA_VERSION, SCHEMA_VERSION.to_string()),
    ];
    Ok(Envelope {
        subject: subject_for(record),
        headers,
        payload,
    })
}

/// Decode a bus payload back into a canonical record.
pub fn decode_record(payload: &[u8]) -> Result<MarketRecord, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}
