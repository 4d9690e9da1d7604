//! Fingerprint dedup cache.
//!
//! Bounded set with TTL eviction: a hash map for membership plus an
//! insertion-ordered ring for expiry. Both caps are hard limits, so memory
//! stays bounded no matter what the venues replay.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub struct DedupCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    seen: HashMap<String, Instant>,
    order: VecDeque<(Instant, String)>,
}

impl DedupCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Record a fingerprint. Returns `true` when it was not present within
    /// the TTL (i.e. the record is fresh and should be published).
    pub fn insert(&self, fingerprint: &str) -> bool {
        self.insert_at(fingerprint, Instant::now())
    }

    fn insert_at(&self, fingerprint: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock();

        // Expire from the front of the ring.
        while let Some((inserted, _)) = inner.order.front() {
            if now.duration_since(*inserted) <= self.ttl {
                break;
            }
            let (_, expired) = inner.order.pop_front().expect("front checked");
            // Only drop the map entry if it was not refreshed since.
            if inner
                .seen
                .get(&expired)
                .is_some_and(|at| now.duration_since(*at) > self.ttl)
            {
                inner.seen.remove(&expired);
            }
        }

        if let Some(last_seen) = inner.seen.get(fingerprint) {
            if now.duration_since(*last_seen) <= self.ttl {
                return false;
            }
        }

        // Capacity is a hard cap: evict oldest when full.
        while inner.seen.len() >= self.capacity {
            match inner.order.pop_front() {
                Some((_, oldest)) => {
                    inner.seen.remove(&oldest);
                }
                None => break,
            }
        }

        inner.seen.insert(fingerprint.to_string(), now);
        inner.order.push_back((now, fingerprint.to_string()));
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
