//! Venue REST weight budgets.
//!
//! Each venue owns one token bucket shared by every task that calls its
//! REST API; WebSocket traffic is not budgeted. A call acquires its
//! endpoint's weight in tokens and blocks until they are available.
//!
//! A 429/418 response opens a penalty window during which acquisition
//! stalls: the first hit waits 2x the advised `Retry-After` (1 s when the
//! venue sends none), doubling per consecutive hit up to a configured cap.
//! Any successful call closes the window.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use types::venue::Exchange;

use config::RateLimitConfig;

/// Weight-budgeted limiter for one venue.
pub struct VenueLimiter {
    exchange: Exchange,
    limiter: DefaultDirectRateLimiter,
    capacity: u32,
    penalty: Mutex<PenaltyState>,
    penalty_cap: Duration,
}

#[derive(Debug, Clone, Copy)]
struct PenaltyState {
    until: Option<Instant>,
    backoff: Option<Duration>,
}

impl VenueLimiter {
    pub fn new(exchange: Exchange, config: &RateLimitConfig) -> Self {
        let refill = NonZeroU32::new(config.refill_per_sec).unwrap_or(nonzero!(1u32));
        let capacity = NonZeroU32::new(config.capacity).unwrap_or(nonzero!(1u32));
        let quota = Quota::per_second(refill).allow_burst(capacity);
        Self {
            exchange,
            limiter: RateLimiter::direct(quota),
            capacity: capacity.get(),
            penalty: Mutex::new(PenaltyState {
                until: None,
                backoff: None,
            }),
            penalty_cap: Duration::from_secs(config.penalty_cap_secs),
        }
    }

    /// Block until `weight` tokens are available and any penalty window has
    /// elapsed. Weights above the bucket capacity are clamped so a
    /// misconfigured endpoint cannot deadlock its venue.
    pub async fn acquire(&self, weight: u32) {
        loop {
            let wait = self.penalty_remaining();
            match wait {
                Some(wait) if !wait.is_zero() => {
                    debug!(exchange = %self.exchange, ?wait, "waiting out rate-limit penalty");
                    tokio::time::sleep(wait).await;
                }
                _ => break,
            }
        }

        let weight = weight.clamp(1, self.capacity);
        // Clamped to capacity above, so the only failure mode
        // (InsufficientCapacity) cannot occur.
        if let Some(weight) = NonZeroU32::new(weight) {
            let _ = self.limiter.until_n_ready(weight).await;
        }
    }

    /// Record a venue rate-limit response and extend the penalty window.
    pub fn on_rate_limited(&self, retry_after: Option<Duration>) {
        let mut penalty = self.penalty.lock();
        let base = retry_after
            .map(|advised| advised * 2)
            .unwrap_or(Duration::from_secs(1));
        let next = match penalty.backoff {
            Some(current) => (current * 2).max(base),
            None => base,
        }
        .min(self.penalty_cap);
        penalty.backoff = Some(next);
        penalty.until = Some(Instant::now() + next);
        warn!(
            exchange = %self.exchange,
            backoff_ms = next.as_millis() as u64,
            "venue rate limit hit, backing off"
        );
    }

    /// A successful call closes the penalty window.
    pub fn on_success(&self) {
        let mut penalty = self.penalty.lock();
        penalty.until = None;
        penalty.backoff = None;
    }

    /// Time left in the current penalty window, if one is open.
    pub fn penalty_remaining(&self) -> Option<Duration> {
        let penalty = self.penalty.lock();
        penalty
            .until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> VenueLimiter {
        VenueLimiter::new(
            Exchange::BinanceSpot,
            &RateLimitConfig {
                capacity: 10,
                refill_per_sec: 10,
                penalty_cap_secs: 8,
            },
        )
    }

    #[tokio::test]
    async fn penalty_doubles_and_caps() {
        let limiter = limiter();
        assert!(limiter.penalty_remaining().is_none());

        limiter.on_rate_limited(None);
        let first = limiter.penalty_remaining().unwrap();
        assert!(first <= Duration::from_secs(1));

        limiter.on_rate_limited(None);
        let second = limiter.penalty_remaining().unwrap();
        assert!(second > first);

        for _ in 0..10 {
            limiter.on_rate_limited(None);
        }
        assert!(limiter.penalty_remaining().unwrap() <= Duration::from_secs(8));
    }

    #[tokio::test]
    async fn advised_retry_after_is_doubled() {
        let limiter = limiter();
        limiter.on_rate_limited(Some(Duration::from_secs(3)));
        let remaining = limiter.penalty_remaining().unwrap();
        assert!(remaining > Duration::from_secs(5));
        assert!(remaining <= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn success_clears_penalty() {
        let limiter = limiter();
        limiter.on_rate_limited(None);
        limiter.on_success();
        assert!(limiter.penalty_remaining().is_none());

        // The next hit starts from the base again.
        limiter.on_rate_limited(None);
        assert!(limiter.penalty_remaining().unwrap() <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn acquire_waits_out_the_penalty() {
        tokio::time::pause();
        let limiter = limiter();
        limiter.on_rate_limited(None);

        let start = Instant::now();
        limiter.acquire(1).await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
