//! Error types for the ingestion service.

use std::time::Duration;

use thiserror::Error;
use types::venue::Exchange;

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Main error type for venue adapters, the order-book engine, and the
/// publish path.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Connection could not be established.
    #[error("connection failed for {exchange}: {reason}")]
    ConnectionFailed { exchange: Exchange, reason: String },

    /// Connect or receive deadline exceeded.
    #[error("connection timeout for {exchange} after {timeout_ms}ms")]
    ConnectionTimeout { exchange: Exchange, timeout_ms: u64 },

    /// Venue closed the connection.
    #[error("connection closed for {exchange}: {reason:?}")]
    ConnectionLost {
        exchange: Exchange,
        reason: Option<String>,
    },

    /// Frame arrived that does not match the venue protocol. Counted and
    /// dropped; the stream continues.
    #[error("protocol violation from {exchange}: {detail}")]
    ProtocolViolation { exchange: Exchange, detail: String },

    /// HTTP 429/418 analogue; opens the adaptive penalty window.
    #[error("rate limited by {exchange} (retry-after {retry_after:?})")]
    VenueRateLimit {
        exchange: Exchange,
        retry_after: Option<Duration>,
    },

    /// Non-success REST response other than a rate limit.
    #[error("REST error from {exchange}: status {status}: {body}")]
    Rest {
        exchange: Exchange,
        status: u16,
        body: String,
    },

    /// Operation the venue does not expose (e.g. funding on a spot feed).
    #[error("{exchange} does not support {operation}")]
    Unsupported {
        exchange: Exchange,
        operation: &'static str,
    },

    /// A worker's inbound or outbound channel closed underneath it.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Symbol(#[from] types::TypeError),

    #[error(transparent)]
    Codec(#[from] codec::CodecError),

    #[error(transparent)]
    Bus(#[from] bus::BusError),
}

impl IngestError {
    /// True when the supervisor should simply retry after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::ConnectionFailed { .. }
                | IngestError::ConnectionTimeout { .. }
                | IngestError::ConnectionLost { .. }
                | IngestError::VenueRateLimit { .. }
                | IngestError::Rest { .. }
                | IngestError::WebSocket(_)
                | IngestError::Http(_)
        )
    }
}
