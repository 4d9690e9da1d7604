//! Rate-governed REST poller.
//!
//! Funding, open interest, long/short ratios, and volatility indices do
//! not stream (or not everywhere), so they are polled. One task per
//! (venue, data type, instrument) ticks on its interval; execution is
//! serialized against the venue's token bucket, which is what keeps a
//! burst of due tasks from blowing the weight budget. 5xx responses retry
//! within the tick; a rate-limit response skips the tick entirely and the
//! penalty window pushes the next eligibility out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use types::records::LsrVariant;
use types::venue::{DataType, Exchange};

use crate::error::IngestError;
use crate::normalize;
use crate::publish::PublisherHandle;
use crate::venue::VenueAdapter;
use config::{PollerConfig, VenueConfig};
use health::{Counter, StatsRegistry};

/// One scheduled fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct PollTask {
    pub exchange: Exchange,
    pub data_type: DataType,
    /// Set for symbol-keyed tasks.
    pub symbol: Option<String>,
    /// Set for LSR tasks.
    pub variant: Option<LsrVariant>,
    /// Set for volatility-index tasks.
    pub currency: Option<String>,
    pub interval: Duration,
}

/// Expand a venue's configuration into its poll schedule.
pub fn build_tasks(poller: &PollerConfig, venue: &VenueConfig) -> Vec<PollTask> {
    let mut tasks = Vec::new();
    let base = PollTask {
        exchange: venue.exchange,
        data_type: DataType::FundingRate,
        symbol: None,
        variant: None,
        currency: None,
        interval: Duration::from_secs(poller.funding_interval_secs),
    };

    for data_type in &venue.data_types {
        match data_type {
            DataType::FundingRate => {
                for symbol in &venue.symbols {
                    tasks.push(PollTask {
                        data_type: DataType::FundingRate,
                        symbol: Some(symbol.clone()),
                        interval: Duration::from_secs(poller.funding_interval_secs),
                        ..base.clone()
                    });
                }
            }
            DataType::OpenInterest => {
                for symbol in &venue.symbols {
                    tasks.push(PollTask {
                        data_type: DataType::OpenInterest,
                        symbol: Some(symbol.clone()),
                        interval: Duration::from_secs(poller.open_interest_interval_secs),
                        ..base.clone()
                    });
                }
            }
            DataType::LongShortRatio => {
                // Variants stay separate HTTP round trips; the venues do
                // not expose a combined endpoint.
                for symbol in &venue.symbols {
                    for variant in [LsrVariant::TopPosition, LsrVariant::AllAccount] {
                        tasks.push(PollTask {
                            data_type: DataType::LongShortRatio,
                            symbol: Some(symbol.clone()),
                            variant: Some(variant),
                            interval: Duration::from_secs(poller.lsr_interval_secs),
                            ..base.clone()
                        });
                    }
                }
            }
            DataType::VolatilityIndex => {
                for currency in &venue.currencies {
                    tasks.push(PollTask {
                        data_type: DataType::VolatilityIndex,
                        currency: Some(currency.clone()),
                        interval: Duration::from_secs(poller.vol_index_interval_secs),
                        ..base.clone()
                    });
                }
            }
            // Trades, books, and liquidations stream over WebSocket.
            _ => {}
        }
    }
    tasks
}

#[derive(Clone)]
pub struct PollerCounters {
    pub polls_ok: Counter,
    pub polls_failed: Counter,
    pub rate_limited: Counter,
}

impl PollerCounters {
    pub fn new(stats: &StatsRegistry) -> Self {
        Self {
            polls_ok: stats.counter("poller.polls_ok"),
            polls_failed: stats.counter("poller.polls_failed"),
            rate_limited: stats.counter("poller.rate_limited"),
        }
    }
}

pub struct Poller {
    adapter: Arc<dyn VenueAdapter>,
    publisher: PublisherHandle,
    config: PollerConfig,
    counters: PollerCounters,
}

impl Poller {
    pub fn new(
        adapter: Arc<dyn VenueAdapter>,
        publisher: PublisherHandle,
        config: PollerConfig,
        counters: PollerCounters,
    ) -> Self {
        Self {
            adapter,
            publisher,
            config,
            counters,
        }
    }

    /// Drive one task until shutdown.
    pub async fn run_task(self: Arc<Self>, task: PollTask, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(task.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once(&task).await;
                }
            }
        }
    }

    /// One tick: fetch with bounded in-tick retries, normalize, enqueue.
    pub async fn poll_once(&self, task: &PollTask) {
        let mut delay = Duration::from_millis(500);
        for attempt in 0..=self.config.retry_attempts {
            match self.fetch(task).await {
                Ok(()) => {
                    self.counters.polls_ok.inc();
                    return;
                }
                Err(IngestError::VenueRateLimit { retry_after, .. }) => {
                    // The penalty window already gates the bucket; skip
                    // this tick.
                    self.counters.rate_limited.inc();
                    debug!(
                        exchange = %task.exchange,
                        data_type = %task.data_type,
                        ?retry_after,
                        "poll rate limited"
                    );
                    return;
                }
                Err(IngestError::Rest { status, .. }) if status >= 500 => {
                    if attempt == self.config.retry_attempts {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!(
                        exchange = %task.exchange,
                        data_type = %task.data_type,
                        error = %e,
                        "poll failed"
                    );
                    self.counters.polls_failed.inc();
                    return;
                }
            }
        }
        warn!(
            exchange = %task.exchange,
            data_type = %task.data_type,
            "poll retries exhausted, skipping tick"
        );
        self.counters.polls_failed.inc();
    }

    async fn fetch(&self, task: &PollTask) -> Result<(), IngestError> {
        let exchange = task.exchange;
        let record = match task.data_type {
            DataType::FundingRate => {
                let symbol = task.symbol.as_deref().unwrap_or_default();
                let raw = self.adapter.fetch_funding(symbol).await?;
                normalize::funding(exchange, raw)?
            }
            DataType::OpenInterest => {
                let symbol = task.symbol.as_deref().unwrap_or_default();
                let raw = self.adapter.fetch_open_interest(symbol).await?;
                normalize::open_interest(exchange, raw)?
            }
            DataType::LongShortRatio => {
                let symbol = task.symbol.as_deref().unwrap_or_default();
                let variant = task.variant.unwrap_or(LsrVariant::AllAccount);
                let raw = self
                    .adapter
                    .fetch_long_short_ratio(symbol, variant, &self.config.lsr_period)
                    .await?;
                normalize::long_short_ratio(exchange, raw)?
            }
            DataType::VolatilityIndex => {
                let currency = task.currency.as_deref().unwrap_or_default();
                let raw = self.adapter.fetch_volatility_index(currency).await?;
                normalize::volatility_index(exchange, raw)?
            }
            other => {
                debug!(?other, "data type is not polled");
                return Ok(());
            }
        };
        self.publisher.push(record);
        Ok(())
    }
}
