//! Hot-writer service.
//!
//! A durable bus consumer routes records into per-kind batchers; each
//! batcher flushes to the hot store as one columnar insert per batch,
//! retries transient failures, and appends irrecoverable batches to a
//! local error log so the consumer never stalls.

pub mod batcher;
pub mod consumer;
pub mod error_log;
pub mod rows;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error(transparent)]
    Bus(#[from] bus::BusError),

    #[error(transparent)]
    Codec(#[from] codec::CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("batcher channel closed for {0}")]
    ChannelClosed(&'static str),
}

pub type Result<T> = std::result::Result<T, WriterError>;
