//! Durable bus consumer.
//!
//! Pulls from the stream's durable consumer, decodes envelopes, routes
//! rows into the batchers, and acks only after the row is accepted by a
//! batcher queue. A full queue therefore pauses consumption instead of
//! losing records; redelivery after a crash is collapsed downstream by
//! the store's replacing merge.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::batcher::BatcherSet;
use crate::rows::row_for;
use crate::Result;
use bus::BusClient;
use health::{Counter, HealthStatus, ServiceHealth, StatsRegistry};

#[derive(Clone)]
pub struct ConsumerCounters {
    pub messages_in: Counter,
    pub decode_failures: Counter,
    pub acked: Counter,
}

impl ConsumerCounters {
    pub fn new(stats: &StatsRegistry) -> Self {
        Self {
            messages_in: stats.counter("consumer.messages_in"),
            decode_failures: stats.counter("consumer.decode_failures"),
            acked: stats.counter("consumer.acked"),
        }
    }
}

pub struct Consumer {
    bus: Arc<BusClient>,
    durable: String,
    batchers: Arc<BatcherSet>,
    counters: ConsumerCounters,
    health: Arc<ServiceHealth>,
}

impl Consumer {
    pub fn new(
        bus: Arc<BusClient>,
        durable: String,
        batchers: Arc<BatcherSet>,
        counters: ConsumerCounters,
        health: Arc<ServiceHealth>,
    ) -> Self {
        Self {
            bus,
            durable,
            batchers,
            counters,
            health,
        }
    }

    /// Consume until shutdown, re-establishing the subscription with
    /// backoff when the stream drops.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.consume_stream(&mut shutdown).await {
                Ok(()) => break, // shutdown
                Err(e) => {
                    self.health.set_check(
                        "bus",
                        HealthStatus::Degraded,
                        Some(e.to_string()),
                    );
                    warn!(error = %e, ?backoff, "consumer stream lost, resubscribing");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
        info!("consumer stopped");
    }

    async fn consume_stream(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let consumer = self.bus.pull_consumer(&self.durable, Vec::new()).await?;
        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| bus::BusError::Consumer(e.to_string()))?;
        self.health.set_healthy("bus");

        loop {
            tokio::select! {
                biased;

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }

                maybe = messages.next() => {
                    let message = match maybe {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            return Err(bus::BusError::Consumer(e.to_string()).into());
                        }
                        None => {
                            return Err(bus::BusError::Consumer(
                                "message stream ended".to_string(),
                            )
                            .into());
                        }
                    };
                    self.handle(message).await;
                }
            }
        }
    }

    async fn handle(&self, message: bus::Message) {
        self.counters.messages_in.inc();

        let record = match codec::decode_record(&message.payload) {
            Ok(record) => record,
            Err(e) => {
                // Poison messages are acked away; they would otherwise
                // redeliver forever.
                self.counters.decode_failures.inc();
                debug!(error = %e, "undecodable message dropped");
                let _ = message.ack().await;
                return;
            }
        };

        let (data_type, row) = row_for(&record);
        match self.batchers.route(data_type, row).await {
            Ok(()) => {
                if message.ack().await.is_ok() {
                    self.counters.acked.inc();
                }
            }
            Err(e) => {
                // Leave unacked: the bus redelivers once the writer
                // recovers.
                warn!(error = %e, "row routing failed, leaving message unacked");
            }
        }
    }
}
