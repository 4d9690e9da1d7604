//! JetStream access layer.
//!
//! Thin wrapper around `async-nats` carrying the pipeline's conventions:
//! the stream is provisioned at startup with the configured limits, every
//! publish carries the record headers plus a `Nats-Msg-Id` so the stream's
//! duplicate window backs up the publisher's own dedup cache, and
//! consumers are durable pull consumers so the writer resumes where it
//! left off.

use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream};
use bytes::Bytes;
use codec::Envelope;
use config::BusConfig;
use thiserror::Error;
use tracing::info;

pub use async_nats::jetstream::consumer::PullConsumer;
pub use async_nats::jetstream::Message;

/// Errors crossing the bus boundary.
///
/// The underlying `async-nats` error types are kind-parameterized; they are
/// carried here as rendered strings since callers only branch on which
/// operation failed.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(String),

    #[error("stream provisioning failed: {0}")]
    Stream(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("publish ack timed out after {0:?}")]
    AckTimeout(Duration),

    #[error("consumer setup failed: {0}")]
    Consumer(String),
}

/// Connected JetStream client bound to one stream.
pub struct BusClient {
    jetstream: jetstream::Context,
    config: BusConfig,
}

impl BusClient {
    /// Connect and provision the stream if it does not exist.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(Duration::from_secs(10))
            .retry_on_initial_connect()
            .connect(&config.url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let jetstream = jetstream::new(client);
        let bus = Self {
            jetstream,
            config: config.clone(),
        };
        bus.ensure_stream().await?;
        Ok(bus)
    }

    /// Create the stream with configured limits when absent; a stream that
    /// already exists is left untouched.
    async fn ensure_stream(&self) -> Result<(), BusError> {
        let config = stream_config(&self.config);
        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| BusError::Stream(e.to_string()))?;
        info!(stream = %self.config.stream, "bus stream ready");
        Ok(())
    }

    /// Publish one envelope and wait for the JetStream ack.
    ///
    /// `msg_id` feeds the stream's duplicate window; re-publishing the same
    /// id within the window is a server-side no-op.
    pub async fn publish(&self, envelope: &Envelope, msg_id: &str) -> Result<(), BusError> {
        let mut headers = async_nats::HeaderMap::new();
        for (name, value) in &envelope.headers {
            headers.insert(*name, value.as_str());
        }
        headers.insert("Nats-Msg-Id", msg_id);

        let ack_future = self
            .jetstream
            .publish_with_headers(
                envelope.subject.clone(),
                headers,
                Bytes::from(envelope.payload.clone()),
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        let timeout = Duration::from_secs(self.config.publish_timeout_secs);
        tokio::time::timeout(timeout, ack_future)
            .await
            .map_err(|_| BusError::AckTimeout(timeout))?
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    /// Durable pull consumer over the given subject filters (empty = all
    /// stream subjects).
    pub async fn pull_consumer(
        &self,
        durable: &str,
        filter_subjects: Vec<String>,
    ) -> Result<PullConsumer, BusError> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream)
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))?;
        stream
            .get_or_create_consumer(
                durable,
                consumer::pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subjects,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))
    }

    /// Ephemeral pull consumer starting at new messages; gone when the
    /// caller disconnects. Used by inspection tooling.
    pub async fn ephemeral_consumer(
        &self,
        filter_subjects: Vec<String>,
    ) -> Result<PullConsumer, BusError> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream)
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))?;
        stream
            .create_consumer(consumer::pull::Config {
                deliver_policy: consumer::DeliverPolicy::New,
                filter_subjects,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Consumer(e.to_string()))
    }
}

/// Map pipeline configuration onto the JetStream stream definition.
fn stream_config(config: &BusConfig) -> stream::Config {
    stream::Config {
        name: config.stream.clone(),
        subjects: codec::stream_subjects(),
        max_messages: config.max_msgs,
        max_bytes: config.max_bytes,
        max_age: Duration::from_secs(config.max_age_hours * 3600),
        discard: stream::DiscardPolicy::Old,
        storage: stream::StorageType::File,
        num_replicas: 1,
        duplicate_window: Duration::from_secs(config.duplicate_window_secs),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_config_carries_limits() {
        let config = stream_config(&BusConfig::default());
        assert_eq!(config.name, "MARKET_DATA");
        assert_eq!(config.max_messages, 5_000_000);
        assert_eq!(config.max_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.max_age, Duration::from_secs(48 * 3600));
        assert_eq!(config.duplicate_window, Duration::from_secs(120));
        assert_eq!(config.num_replicas, 1);
        assert!(matches!(config.discard, stream::DiscardPolicy::Old));
        assert!(matches!(config.storage, stream::StorageType::File));
        assert_eq!(config.subjects.len(), 7);
    }
}
