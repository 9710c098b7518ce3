//! # Pipeline Monitoring
//!
//! Lock-free state read by the server's periodic status log.
//!
//! - **`IngestCounters`**: running totals for polls, decoding and matching.
//! - **`BacklogGuard`**: how many raw listings are sitting in the decode queue
//!   and have not been decoded yet. With a **bounded** queue the producer simply
//!   waits for capacity and the guard only reports depth. With an explicitly
//!   **unbounded** queue nothing slows the producer down, so the guard is what
//!   notices that decoding has fallen behind: `increment` returns `false` once
//!   the configured threshold is crossed and the producer logs it.
//!
//! All atomics use `Ordering::Relaxed`: only each counter's own value matters,
//! no other memory is published through it.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct IngestCounters {
    pub polls: AtomicU64,
    pub empty_polls: AtomicU64,
    pub failed_polls: AtomicU64,
    pub batches_decoded: AtomicU64,
    pub listings_decoded: AtomicU64,
    pub listings_dropped: AtomicU64,
    pub matches: AtomicU64,
    pub predicate_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub polls: u64,
    pub empty_polls: u64,
    pub failed_polls: u64,
    pub batches_decoded: u64,
    pub listings_decoded: u64,
    pub listings_dropped: u64,
    pub matches: u64,
    pub predicate_errors: u64,
}

impl IngestCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            failed_polls: self.failed_polls.load(Ordering::Relaxed),
            batches_decoded: self.batches_decoded.load(Ordering::Relaxed),
            listings_decoded: self.listings_decoded.load(Ordering::Relaxed),
            listings_dropped: self.listings_dropped.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            predicate_errors: self.predicate_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct BacklogGuard {
    /// Number of pending listings above which the backlog is reported.
    threshold: u64,
    /// Listings enqueued but not yet decoded.
    pending: AtomicU64,
    /// Highest `pending` value ever observed.
    high_water: AtomicU64,
}

impl BacklogGuard {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            pending: AtomicU64::new(0),
            high_water: AtomicU64::new(0),
        }
    }

    /// Records `count` newly enqueued listings.
    ///
    /// Returns `false` when the backlog is now above the threshold.
    pub fn increment(&self, count: u64) -> bool {
        // `fetch_add` returns the value *before* the addition.
        let now = self.pending.fetch_add(count, Ordering::Relaxed) + count;
        self.high_water.fetch_max(now, Ordering::Relaxed);
        now <= self.threshold
    }

    /// Records `count` listings leaving the queue (decoded or discarded).
    pub fn decrement(&self, count: u64) {
        // Saturate instead of wrapping if a caller over-reports.
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(count)));
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn high_water(&self) -> u64 {
        self.high_water.load(Ordering::Relaxed)
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Backlog as a percentage of the threshold. Useful for diagnostics.
    pub fn usage_percent(&self) -> f64 {
        let current = self.pending() as f64;
        let total = self.threshold as f64;
        if total == 0.0 {
            0.0
        } else {
            (current / total) * 100.0
        }
    }
}
