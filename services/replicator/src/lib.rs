//! Cold-replicator service.
//!
//! Advances a per-table high watermark in fixed time windows, copying
//! rows hot -> cold with an idempotent cross-instance
//! `INSERT ... SELECT ... remote(...)`. A failed window leaves the
//! watermark untouched and is retried next run; the cold tables'
//! replacing merge makes the retry safe.

pub mod replicate;
pub mod watermark;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error("watermark persistence failed: {0}")]
    Watermark(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReplicatorError>;
