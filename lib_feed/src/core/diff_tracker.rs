//! # Live Diff Tracker
//!
//! Wraps a fetch (a registry working set, a one-shot search, anything that
//! implements `ListingSource`) into a supervised refresh loop that publishes
//! New/Removed events.
//!
//! ## Key Design Principles:
//! - **Three trigger modes**: `Manual` only fetches on `refresh()`, `Periodic`
//!   fetches on a fixed interval (first tick immediately), `Live` fetches again
//!   as soon as the source reports it is ready (`ListingSource::ready`).
//! - **Busy means fetching**: the busy flag is raised only after a trigger fired,
//!   never while a live trigger is waiting for the source.
//! - **Tear down before install**: the trigger source is a local owned by the
//!   pipeline loop; a mode change drops the old one before the new one is built,
//!   so two modes never fire side by side. A fetch still in flight when the mode
//!   changes is dropped.
//! - **No queued duplicates**: a manual refresh while a fetch is in flight is
//!   dropped, and periodic ticks missed during a fetch are skipped.
//! - **Supervision**: any error marks the tracker not busy, records the error,
//!   publishes it, and restarts the pipeline after `retry_delay`. There is no
//!   retry limit.
//! - **Deterministic disposal**: `dispose()` cancels the loop, which drops any
//!   in-flight fetch, and waits for the task to finish.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::diff::ExistingItems;
use crate::core::dispatcher::{Dispatcher, Subscription};
use crate::error::{IngestError, IngestResult};
use crate::model::listing::{Listing, ListingId};

/// Anything the tracker can (re)fetch a full listing set from.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch(&self) -> IngestResult<Vec<Listing>>;

    /// Resolves when a live-mode tracker should fetch again. Fires at once
    /// unless the source can tell when its data moved.
    async fn ready(&self) -> IngestResult<()> {
        tokio::task::yield_now().await;
        Ok(())
    }

    fn describe(&self) -> String {
        "listing source".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Manual,
    Periodic(Duration),
    Live,
}

/// One event on a consumer-facing stream (a tracker or a live-notify session).
#[derive(Debug, Clone, Default)]
pub struct ListingUpdate {
    /// Listings carried by the event; empty for pure status changes.
    pub listings: Vec<Listing>,
    pub is_busy: bool,
    pub last_error: Option<IngestError>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TrackerStatus {
    pub mode: RefreshMode,
    pub is_busy: bool,
    pub last_error: Option<IngestError>,
    pub last_update: Option<DateTime<Utc>>,
    pub existing_items: usize,
}

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub mode: RefreshMode,
    /// Delay before the pipeline is restarted after a failure.
    pub retry_delay: Duration,
    /// Number of past updates replayed to late subscribers.
    pub replay: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            mode: RefreshMode::Manual,
            retry_delay: Duration::from_secs(5),
            replay: 1,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    last_error: Option<IngestError>,
    last_update: Option<DateTime<Utc>>,
    current: Vec<Listing>,
    existing: ExistingItems,
}

struct TrackerShared {
    name: String,
    source: Arc<dyn ListingSource>,
    retry_delay: Duration,
    busy: AtomicBool,
    state: Mutex<TrackerState>,
    dispatcher: Dispatcher<ListingUpdate>,
    refresh: Notify,
    mode: watch::Sender<RefreshMode>,
    cancel: CancellationToken,
}

pub struct LiveDiffTracker {
    shared: Arc<TrackerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveDiffTracker {
    /// Starts the supervisor on the current tokio runtime.
    pub fn spawn(name: impl Into<String>, source: Arc<dyn ListingSource>, options: TrackerOptions) -> Self {
        let name = name.into();
        let (mode, _) = watch::channel(options.mode);
        let shared = Arc::new(TrackerShared {
            dispatcher: Dispatcher::new(format!("tracker:{}", name), options.replay),
            name,
            source,
            retry_delay: options.retry_delay,
            busy: AtomicBool::new(false),
            state: Mutex::new(TrackerState::default()),
            refresh: Notify::new(),
            mode,
            cancel: CancellationToken::new(),
        });

        let task = tokio::spawn(supervise(Arc::clone(&shared)));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn subscribe(&self) -> Subscription<ListingUpdate> {
        self.shared.dispatcher.subscribe()
    }

    pub fn mode(&self) -> RefreshMode {
        *self.shared.mode.borrow()
    }

    /// Replaces the trigger source. The old one is torn down first.
    pub fn set_mode(&self, mode: RefreshMode) {
        let previous = self.shared.mode.send_replace(mode);
        if previous != mode {
            log::info!("[{}] refresh mode {:?} -> {:?}", self.shared.name, previous, mode);
        }
    }

    /// Requests one fetch. Returns `false` when it was dropped because a fetch is
    /// already in flight.
    pub fn refresh(&self) -> bool {
        if self.shared.busy.load(Ordering::Acquire) {
            log::debug!("[{}] refresh dropped, fetch in flight", self.shared.name);
            return false;
        }
        self.shared.refresh.notify_one();
        true
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn status(&self) -> TrackerStatus {
        let state = self.shared.lock_state();
        TrackerStatus {
            mode: self.mode(),
            is_busy: self.is_busy(),
            last_error: state.last_error.clone(),
            last_update: state.last_update,
            existing_items: state.existing.len(),
        }
    }

    /// The batch returned by the most recent successful fetch.
    pub fn current_snapshot(&self) -> Vec<Listing> {
        self.shared.lock_state().current.clone()
    }

    pub fn existing_ids(&self) -> Vec<ListingId> {
        self.shared.lock_state().existing.ids()
    }

    /// Stops the loop, drops any in-flight fetch, waits for the task and ends
    /// every subscriber stream. Safe to call more than once.
    pub async fn dispose(&self) {
        self.shared.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("[{}] tracker task ended abnormally: {}", self.shared.name, e);
            }
        }
        self.shared.busy.store(false, Ordering::Release);
        self.shared.dispatcher.close();
    }
}

impl Drop for LiveDiffTracker {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl TrackerShared {
    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, listings: Vec<Listing>) {
        let state = self.lock_state();
        let update = ListingUpdate {
            listings,
            is_busy: self.busy.load(Ordering::Acquire),
            last_error: state.last_error.clone(),
            last_update: state.last_update,
        };
        drop(state);
        self.dispatcher.broadcast(update);
    }

    async fn cycle(&self) -> IngestResult<()> {
        self.busy.store(true, Ordering::Release);
        self.publish(Vec::new());

        let batch = self.source.fetch().await?;

        let output = {
            let mut state = self.lock_state();
            let output = state.existing.apply(batch.clone());
            state.current = batch;
            state.last_update = Some(Utc::now());
            state.last_error = None;
            output
        };
        self.busy.store(false, Ordering::Release);

        log::debug!("[{}] cycle produced {} event(s)", self.name, output.len());
        self.publish(output);
        Ok(())
    }

    fn abandon_cycle(&self) {
        if self.busy.swap(false, Ordering::AcqRel) {
            log::debug!("[{}] fetch in flight dropped on mode change", self.name);
            self.publish(Vec::new());
        }
    }

    fn record_failure(&self, error: IngestError) {
        self.busy.store(false, Ordering::Release);
        self.lock_state().last_error = Some(error);
        self.publish(Vec::new());
    }
}

/// Owned trigger source for one mode.
enum Trigger {
    Manual,
    Periodic(Interval),
    Live,
}

impl Trigger {
    fn install(mode: RefreshMode) -> Self {
        match mode {
            RefreshMode::Manual => Trigger::Manual,
            RefreshMode::Periodic(period) => {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Trigger::Periodic(ticker)
            }
            RefreshMode::Live => Trigger::Live,
        }
    }

    async fn fired(&mut self, refresh: &Notify, source: &dyn ListingSource) -> IngestResult<()> {
        match self {
            Trigger::Manual => refresh.notified().await,
            Trigger::Periodic(ticker) => {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = refresh.notified() => {}
                }
            }
            Trigger::Live => return source.ready().await,
        }
        Ok(())
    }
}

async fn run_pipeline(shared: &TrackerShared) -> IngestResult<()> {
    let mut mode_rx = shared.mode.subscribe();
    let mut trigger = Trigger::install(*mode_rx.borrow_and_update());

    loop {
        tokio::select! {
            biased;
            changed = mode_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                // Drop the old trigger before building the new one.
                drop(trigger);
                trigger = Trigger::install(*mode_rx.borrow_and_update());
            }
            fired = trigger.fired(&shared.refresh, shared.source.as_ref()) => {
                fired?;
                tokio::select! {
                    biased;
                    changed = mode_rx.changed() => {
                        shared.abandon_cycle();
                        if changed.is_err() {
                            return Ok(());
                        }
                        drop(trigger);
                        trigger = Trigger::install(*mode_rx.borrow_and_update());
                    }
                    outcome = shared.cycle() => outcome?,
                }
            }
        }
    }
}

async fn supervise(shared: Arc<TrackerShared>) {
    log::info!("[{}] tracker started on {}", shared.name, shared.source.describe());

    loop {
        let outcome = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            outcome = run_pipeline(&shared) => outcome,
        };

        match outcome {
            Ok(()) => break,
            Err(e) => {
                log::warn!(
                    "[{}] pipeline failed: {}. Resubscribing in {:?}...",
                    shared.name,
                    e,
                    shared.retry_delay
                );
                shared.record_failure(e);
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = sleep(shared.retry_delay) => {}
                }
            }
        }
    }

    log::info!("[{}] tracker stopped", shared.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted(Mutex<VecDeque<Vec<Listing>>>);

    #[async_trait]
    impl ListingSource for Scripted {
        async fn fetch(&self) -> IngestResult<Vec<Listing>> {
            Ok(self.0.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    fn l(id: &str) -> Listing {
        Listing::new(id, "Standard", id)
    }

    async fn next_result(rx: &mut Subscription<ListingUpdate>) -> Arc<ListingUpdate> {
        loop {
            let update = rx.recv().await.expect("stream ended");
            if !update.is_busy {
                return update;
            }
        }
    }

    #[tokio::test]
    async fn test_manual_mode_diffs_each_refresh() {
        let source = Scripted(Mutex::new(VecDeque::from(vec![
            vec![l("A"), l("B")],
            vec![l("B"), l("C")],
        ])));
        let tracker = LiveDiffTracker::spawn("manual", Arc::new(source), TrackerOptions::default());
        let mut rx = tracker.subscribe();

        assert!(tracker.refresh());
        let first = next_result(&mut rx).await;
        assert_eq!(first.listings.len(), 2);

        assert!(tracker.refresh());
        let second = next_result(&mut rx).await;
        let summary: Vec<_> = second.listings.iter().map(|x| (x.id.to_string(), x.state)).collect();
        assert_eq!(
            summary,
            vec![
                ("A".to_string(), crate::model::ListingState::Removed),
                ("C".to_string(), crate::model::ListingState::New)
            ]
        );
        assert_eq!(tracker.existing_ids(), vec![ListingId::from("B"), ListingId::from("C")]);
        assert!(second.last_update.is_some());

        tracker.dispose().await;
        tracker.dispose().await;
    }
}
