//! Proactive connection rotation.
//!
//! Venues that cut connections around the 24-hour mark get a replacement
//! connection opened shortly before the cutoff. During the overlap window
//! both connections deliver the same stream, so events pass through a
//! bounded set of venue-native ids ([`RecentIds`]) and each is emitted at
//! most once. [`RotationState`] tracks the window itself.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// Bounded insertion-ordered id set, one per rotating stream.
pub struct RecentIds {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record an id; returns `true` when it has not been seen recently
    /// (i.e. the event should be forwarded).
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.seen.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

/// Where one connection stands in its rotation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    /// Single connection, too young to rotate.
    Stable,
    /// Replacement connection is up; both deliver through the dedup set.
    Overlapping,
}

/// Tracks when to rotate and how long the overlap may run.
#[derive(Debug)]
pub struct RotationState {
    rotate_after: Duration,
    overlap: Duration,
    opened_at: Instant,
    overlap_started_at: Option<Instant>,
}

impl RotationState {
    pub fn new(rotate_after: Duration, overlap: Duration) -> Self {
        Self {
            rotate_after,
            overlap,
            opened_at: Instant::now(),
            overlap_started_at: None,
        }
    }

    pub fn overlap(&self) -> Duration {
        self.overlap
    }

    pub fn phase(&self) -> RotationPhase {
        if self.overlap_started_at.is_some() {
            RotationPhase::Overlapping
        } else {
            RotationPhase::Stable
        }
    }

    /// The active connection has reached the rotation threshold.
    pub fn due(&self) -> bool {
        self.overlap_started_at.is_none() && self.opened_at.elapsed() >= self.rotate_after
    }

    /// Deadline for the rotation check timer.
    pub fn next_deadline(&self) -> Instant {
        match self.overlap_started_at {
            Some(started) => started + self.overlap,
            None => self.opened_at + self.rotate_after,
        }
    }

    /// Replacement connection opened; the overlap window starts now.
    pub fn begin_overlap(&mut self) {
        self.overlap_started_at = Some(Instant::now());
    }

    /// The overlap window has run its course.
    pub fn overlap_expired(&self) -> bool {
        self.overlap_started_at
            .map(|started| started.elapsed() >= self.overlap)
            .unwrap_or(false)
    }

    /// Rotation finished: the replacement is now the primary.
    pub fn complete(&mut self) {
        self.opened_at = Instant::now();
        self.overlap_started_at = None;
    }

    /// Rotation aborted (replacement never became healthy); the old
    /// connection stays primary and the clock keeps running so the next
    /// check retries promptly.
    pub fn abort(&mut self) {
        self.overlap_started_at = None;
    }
}
