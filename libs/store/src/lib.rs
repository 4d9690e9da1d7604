//! Analytical-store access layer.
//!
//! Both tiers are the same columnar engine reached over its HTTP
//! interface: batched `INSERT ... FORMAT JSONEachRow` writes, DDL at
//! startup, and the cross-instance `remote()` reads the replicator builds
//! its `INSERT ... SELECT` statements from. Table definitions live in
//! [`schema`] so hot and cold stay structurally identical apart from TTL.

pub mod client;
pub mod schema;

pub use client::{rows_to_body, ClickHouseClient};
pub use schema::{create_database_sql, create_table_sql};

use thiserror::Error;

/// Errors from the store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Malformed(String),
}
