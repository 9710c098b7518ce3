//! # Feed Pipeline
//!
//! The coordinator that wires poller → decode queue → decode worker → registry
//! and owns their background tasks.
//!
//! ## Lifecycle:
//! 1.  **`new`**: builds every stage. Nothing runs yet.
//! 2.  **`start`**: spawns the decode worker, then the poller. Each task gets its
//!     own cancellation token and its join handle is kept as a teardown handle.
//! 3.  **`refresh_now`**: asks the poller for an early poll (still rate limited).
//! 4.  **`shutdown`**: releases the teardown handles in reverse start order, so
//!     the poller stops producing before the worker stops consuming. Idempotent.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::settings::IngestSettings;
use crate::core::monitor::{BacklogGuard, CounterSnapshot, IngestCounters};
use crate::core::decode_queue::{batch_queue, DecodeWorker};
use crate::core::diff_tracker::{LiveDiffTracker, TrackerOptions};
use crate::core::registry::{QueryHandle, QueryMatchRegistry, RegistrySnapshotSource};
use crate::decode::ListingDecoder;
use crate::error::{IngestError, IngestResult};
use crate::ingestors::change_feed::{ChangeFeedPoller, ChangeFeedSource, CursorSeed};

/// A running background task and the token that stops it.
struct TeardownHandle {
    name: &'static str,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct FeedPipeline {
    poller: Arc<ChangeFeedPoller>,
    registry: Arc<QueryMatchRegistry>,
    counters: Arc<IngestCounters>,
    backlog: Arc<BacklogGuard>,
    /// Taken by `start`.
    worker: Mutex<Option<DecodeWorker>>,
    /// In start order.
    handles: Mutex<Vec<TeardownHandle>>,
}

impl FeedPipeline {
    pub fn new(
        settings: &IngestSettings,
        source: Arc<dyn ChangeFeedSource>,
        seeds: Vec<Arc<dyn CursorSeed>>,
        decoder: Arc<dyn ListingDecoder>,
    ) -> Self {
        let counters = Arc::new(IngestCounters::default());
        let backlog = Arc::new(BacklogGuard::new(settings.backlog_warn_threshold));
        let registry = Arc::new(QueryMatchRegistry::with_counters(
            settings.registry_identity,
            Arc::clone(&counters),
        ));

        let (tx, rx) = batch_queue(settings.queue, Arc::clone(&backlog));
        let poller = Arc::new(ChangeFeedPoller::new(
            source,
            seeds,
            tx,
            settings.poller_options(),
            Arc::clone(&counters),
        ));
        let worker = DecodeWorker::new(rx, decoder, Arc::clone(&registry), Arc::clone(&counters));

        Self {
            poller,
            registry,
            counters,
            backlog,
            worker: Mutex::new(Some(worker)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Builds the pipeline over the HTTP feed and seed sources named in `settings`,
    /// decoding with the default JSON decoder.
    #[cfg(feature = "retrieve")]
    pub fn from_settings(settings: &IngestSettings) -> IngestResult<Self> {
        use crate::decode::JsonListingDecoder;
        use crate::retrieve::http_sources::{HttpChangeFeed, HttpCursorSeed};

        settings.validate()?;
        let client = settings.client_options();
        let source = Arc::new(HttpChangeFeed::new(&settings.feed_url, client.clone())?);
        let mut seeds: Vec<Arc<dyn CursorSeed>> = Vec::with_capacity(settings.seeds.len());
        for seed in &settings.seeds {
            seeds.push(Arc::new(HttpCursorSeed::new(
                seed.name.clone(),
                &seed.url,
                seed.cursor_field.clone(),
                client.clone(),
            )?));
        }
        Ok(Self::new(settings, source, seeds, Arc::new(JsonListingDecoder)))
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<TeardownHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the decode worker and the poller.
    ///
    /// # Errors
    /// `Config` when the pipeline was already started.
    pub fn start(&self) -> IngestResult<()> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| IngestError::Config("pipeline already started".into()))?;

        let mut handles = self.lock_handles();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(worker.run(cancel.clone()));
        handles.push(TeardownHandle {
            name: "decode worker",
            cancel,
            task,
        });

        let cancel = CancellationToken::new();
        let poller = Arc::clone(&self.poller);
        let token = cancel.clone();
        let task = tokio::spawn(async move { poller.run(token).await });
        handles.push(TeardownHandle {
            name: "change feed poller",
            cancel,
            task,
        });

        log::info!("Feed pipeline started");
        Ok(())
    }

    pub fn refresh_now(&self) {
        self.poller.refresh_now();
    }

    /// Stops every task in reverse start order and waits for each. Idempotent.
    pub async fn shutdown(&self) {
        let handles: Vec<TeardownHandle> = self.lock_handles().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles.into_iter().rev() {
            handle.cancel.cancel();
            match handle.task.await {
                Ok(()) => log::info!("Stopped {}", handle.name),
                Err(e) => log::error!("{} ended abnormally: {}", handle.name, e),
            }
        }
        log::info!("Feed pipeline shut down. Counters: {:?}", self.counters.snapshot());
    }

    pub fn registry(&self) -> Arc<QueryMatchRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn poller(&self) -> &ChangeFeedPoller {
        &self.poller
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn backlog(&self) -> &BacklogGuard {
        &self.backlog
    }

    /// Starts a diff tracker over a registered query's working set.
    ///
    /// In live mode the tracker waits for the working set to change between
    /// fetches instead of re-reading it in a tight loop. Manual and periodic
    /// fetches read the working set as it is.
    pub fn attach_tracker(&self, handle: QueryHandle, options: TrackerOptions) -> IngestResult<LiveDiffTracker> {
        let source = RegistrySnapshotSource::wait_for_change(Arc::clone(&self.registry), handle)?;
        Ok(LiveDiffTracker::spawn(handle.to_string(), Arc::new(source), options))
    }
}
