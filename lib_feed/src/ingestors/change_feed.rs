//! # Change Feed Poller
//!
//! A self-scheduling client for the public, cursor-paginated change feed. Each
//! `poll()` fetches one page at the current cursor and hands the raw page to the
//! decode queue; decoding never happens on this loop.
//!
//! ## Key Design Principles:
//! - **One fetch per poll, one poll at a time**: the cursor lives behind an async
//!   mutex that is held for the whole poll, so concurrent callers (the scheduled
//!   tick and a manual "refresh now") serialize.
//! - **Rate limited, never skipped**: every feed request goes through the
//!   `RequestGate`. An early refresh waits for the remainder of the interval.
//! - **Monotonic cursor**: an empty page leaves the cursor untouched, a non-empty
//!   page adopts the proposed next cursor only after the batch is enqueued, and a
//!   regressing cursor is rejected as a protocol error.
//! - **Seed fallback chain**: without a cursor the ordered seed sources are tried
//!   until one answers. If all fail the poll fails and the next tick retries.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::monitor::IngestCounters;
use crate::core::decode_queue::BatchSender;
use crate::core::rate_gate::RequestGate;
use crate::error::{IngestError, IngestResult};
use crate::model::change_id::ChangeId;
use crate::model::feed_page::{FeedPage, RawBatch};

/// One page of the change feed, fetched at a given cursor.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    async fn fetch_page(&self, cursor: &ChangeId) -> IngestResult<FeedPage>;

    fn describe(&self) -> String {
        "change feed".to_string()
    }
}

/// A read-only endpoint that knows a recent cursor.
#[async_trait]
pub trait CursorSeed: Send + Sync {
    fn name(&self) -> String;

    async fn fetch_cursor(&self) -> IngestResult<ChangeId>;
}

/// What one successful poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A non-empty page was enqueued and the cursor moved.
    Advanced {
        from: ChangeId,
        to: ChangeId,
        groups: usize,
        listings: usize,
    },
    /// The page held no listing groups; the cursor is unchanged.
    NoMovement { cursor: ChangeId },
}

#[derive(Debug, Clone)]
pub struct PollerOptions {
    /// Cadence of the scheduled poll in `run`.
    pub poll_interval: Duration,
    /// Minimum spacing between two feed requests.
    pub min_request_interval: Duration,
    /// Resume from this cursor instead of asking the seed chain.
    pub initial_cursor: Option<ChangeId>,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            min_request_interval: Duration::from_secs(1),
            initial_cursor: None,
        }
    }
}

pub struct ChangeFeedPoller {
    source: Arc<dyn ChangeFeedSource>,
    seeds: Vec<Arc<dyn CursorSeed>>,
    gate: RequestGate,
    queue: BatchSender,
    /// Current cursor. Locked for the duration of a poll.
    cursor: Mutex<Option<ChangeId>>,
    counters: Arc<IngestCounters>,
    refresh: Notify,
    poll_interval: Duration,
}

impl ChangeFeedPoller {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        seeds: Vec<Arc<dyn CursorSeed>>,
        queue: BatchSender,
        options: PollerOptions,
        counters: Arc<IngestCounters>,
    ) -> Self {
        let initial = options.initial_cursor.filter(|c| !c.is_empty());
        if let Some(cursor) = &initial {
            log::info!("Resuming change feed from configured cursor {}", cursor);
        }
        Self {
            source,
            seeds,
            gate: RequestGate::new(options.min_request_interval),
            queue,
            cursor: Mutex::new(initial),
            counters,
            refresh: Notify::new(),
            poll_interval: options.poll_interval,
        }
    }

    /// Current cursor, `None` before the first successful bootstrap.
    pub async fn cursor(&self) -> Option<ChangeId> {
        self.cursor.lock().await.clone()
    }

    /// Performs at most one feed fetch.
    pub async fn poll(&self) -> IngestResult<PollOutcome> {
        let mut slot = self.cursor.lock().await;
        IngestCounters::add(&self.counters.polls, 1);

        let result = self.poll_locked(&mut slot).await;
        if result.is_err() {
            IngestCounters::add(&self.counters.failed_polls, 1);
        }
        result
    }

    async fn poll_locked(&self, slot: &mut Option<ChangeId>) -> IngestResult<PollOutcome> {
        let cursor = match slot.as_ref() {
            Some(cursor) => cursor.clone(),
            None => {
                let seeded = self.bootstrap().await?;
                *slot = Some(seeded.clone());
                seeded
            }
        };

        let waited = self.gate.acquire().await;
        if !waited.is_zero() {
            log::debug!("Feed request delayed {:?} by rate gate", waited);
        }

        let page = self.source.fetch_page(&cursor).await?;

        if page.stashes.is_empty() {
            IngestCounters::add(&self.counters.empty_polls, 1);
            log::info!("No new listings at cursor {}", cursor);
            return Ok(PollOutcome::NoMovement { cursor });
        }

        let next = page.next_change_id;
        if next.is_empty() {
            return Err(IngestError::Protocol(format!(
                "page at {} carried listings but no next_change_id",
                cursor
            )));
        }
        if next.regresses_from(&cursor) {
            return Err(IngestError::Protocol(format!("cursor regressed from {} to {}", cursor, next)));
        }

        let batch = RawBatch {
            cursor: cursor.clone(),
            next_cursor: next.clone(),
            groups: page.stashes,
            received_at: Utc::now(),
        };
        let groups = batch.groups.len();
        let listings = batch.listing_count();

        self.queue.push(batch).await?;
        *slot = Some(next.clone());

        log::debug!("Cursor {} -> {} ({} group(s), {} listing(s))", cursor, next, groups, listings);
        Ok(PollOutcome::Advanced {
            from: cursor,
            to: next,
            groups,
            listings,
        })
    }

    /// Tries the seed chain in order; the first non-empty cursor wins.
    async fn bootstrap(&self) -> IngestResult<ChangeId> {
        if self.seeds.is_empty() {
            return Err(IngestError::Bootstrap("no cursor seed configured".into()));
        }

        let mut failures = Vec::with_capacity(self.seeds.len());
        for seed in &self.seeds {
            match seed.fetch_cursor().await {
                Ok(cursor) if !cursor.is_empty() => {
                    log::info!("Cursor seeded from {}: {}", seed.name(), cursor);
                    return Ok(cursor);
                }
                Ok(_) => {
                    log::warn!("Cursor seed {} returned an empty cursor", seed.name());
                    failures.push(format!("{}: empty cursor", seed.name()));
                }
                Err(e) => {
                    log::warn!("Cursor seed {} failed: {}", seed.name(), e);
                    failures.push(format!("{}: {}", seed.name(), e));
                }
            }
        }
        Err(IngestError::Bootstrap(failures.join("; ")))
    }

    /// Asks `run` to poll now instead of waiting for the next tick. The rate gate
    /// still applies.
    pub fn refresh_now(&self) {
        self.refresh.notify_one();
    }

    /// # Main Execution Loop
    ///
    /// Polls on every tick of `poll_interval` (or on `refresh_now`) until `cancel`
    /// fires. Failures are logged and the next tick tries again; the cursor is
    /// left as it was.
    pub async fn run(&self, cancel: CancellationToken) {
        log::info!(
            "Change feed poller started on {} (every {:?})",
            self.source.describe(),
            self.poll_interval
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.refresh.notified() => log::debug!("Feed refresh requested"),
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.poll() => outcome,
            };

            match outcome {
                Ok(PollOutcome::Advanced { listings, to, .. }) => {
                    log::debug!("Enqueued {} listing(s), cursor now {}", listings, to);
                }
                Ok(PollOutcome::NoMovement { .. }) => {}
                Err(IngestError::QueueClosed) => {
                    log::error!("Decode queue closed, stopping poller");
                    break;
                }
                Err(e) => {
                    log::warn!("Feed poll failed: {}. Retrying next tick", e);
                }
            }
        }

        log::info!("Change feed poller stopped");
    }
}
