//! ClickHouse HTTP client.

use config::ClickHouseConfig;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::StoreError;

/// One ClickHouse endpoint over HTTP.
pub struct ClickHouseClient {
    http: reqwest::Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickHouseClient {
    pub fn new(config: &ClickHouseConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: config.url.clone(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn request(&self, query: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(&self.url)
            .query(&[("query", query)]);
        if let Some(user) = &self.user {
            builder = builder.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            builder = builder.header("X-ClickHouse-Key", password);
        }
        builder
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Server {
            status: status.as_u16(),
            body,
        })
    }

    /// Execute a statement with no result set (DDL, INSERT...SELECT,
    /// ALTER).
    pub async fn execute(&self, sql: &str) -> Result<(), StoreError> {
        debug!(sql, "executing statement");
        let response = self.request(sql).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Batched insert: one HTTP request per batch, rows as JSONEachRow.
    pub async fn insert_rows(&self, table: &str, rows: &[Value]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let query = format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            self.database, table
        );
        let response = self
            .request(&query)
            .body(rows_to_body(rows))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Run a scalar SELECT (e.g. `count()`), returning the raw value.
    pub async fn query_scalar(&self, sql: &str) -> Result<String, StoreError> {
        let query = format!("{sql} FORMAT TabSeparated");
        let response = self.request(&query).send().await?;
        let body = Self::check(response).await?.text().await?;
        Ok(body.trim().to_string())
    }

    /// Scalar count helper.
    pub async fn count(&self, sql: &str) -> Result<u64, StoreError> {
        let raw = self.query_scalar(sql).await?;
        raw.parse()
            .map_err(|_| StoreError::Malformed(format!("expected count, got {raw:?}")))
    }
}

/// Serialize rows as newline-delimited JSON, the shape JSONEachRow
/// ingests.
pub fn rows_to_body(rows: &[Value]) -> String {
    let mut body = String::new();
    for row in rows {
        body.push_str(&row.to_string());
        body.push('\n');
    }
    body
}
