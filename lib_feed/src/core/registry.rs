//! # Query Match Registry
//!
//! Holds every active client query together with its working set, the
//! deduplicated listings that matched it so far.
//!
//! ## Key Design Principles:
//! - **Reference counting by handle**: with structural identity, registering an
//!   equal query twice hands out two handles onto one working set. The working
//!   set is dropped when its last handle is unregistered.
//! - **No global lock across fan-out**: the query map is a `DashMap`. A batch
//!   fan-out clones the entry `Arc`s first and then locks one working set at a
//!   time, so clients can register and unregister while a batch is being
//!   matched.
//! - **Isolation**: a predicate error (or panic) only costs that query its
//!   update; the other queries still receive the batch.
//! - **Change notification**: every entry carries a `watch` revision counter that
//!   bumps when its working set changes, so a live subscriber can wait for the
//!   next change instead of spinning.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use uuid::Uuid;

use crate::core::monitor::IngestCounters;
use crate::core::diff_tracker::ListingSource;
use crate::error::{contain_panic, IngestError, IngestResult};
use crate::model::listing::{Listing, ListingId};
use crate::model::query::ListingPredicate;

/// How registrations are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryIdentity {
    /// Equal predicates (same fingerprint) share one working set.
    #[default]
    Structural,
    /// Every registration gets an independent working set.
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryHandle(u64);

impl QueryHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Immutable copy of a working set.
#[derive(Debug, Clone, Serialize)]
pub struct ResultSet {
    /// Fresh correlation id for this snapshot.
    pub id: Uuid,
    pub handle: QueryHandle,
    /// Working-set revision the copy was taken at.
    pub revision: u64,
    /// Sorted by listing id.
    pub listings: Vec<Listing>,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub queries: usize,
    pub matched: usize,
    pub predicate_errors: usize,
}

struct QueryEntry {
    predicate: Arc<dyn ListingPredicate>,
    working_set: RwLock<HashMap<ListingId, Listing>>,
    handles: Mutex<HashSet<QueryHandle>>,
    revision: watch::Sender<u64>,
}

impl QueryEntry {
    fn new(predicate: Arc<dyn ListingPredicate>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            predicate,
            working_set: RwLock::new(HashMap::new()),
            handles: Mutex::new(HashSet::new()),
            revision,
        }
    }
}

pub struct QueryMatchRegistry {
    identity: QueryIdentity,
    entries: DashMap<String, Arc<QueryEntry>>,
    handles: DashMap<QueryHandle, String>,
    next_handle: AtomicU64,
    counters: Arc<IngestCounters>,
}

impl QueryMatchRegistry {
    pub fn new(identity: QueryIdentity) -> Self {
        Self::with_counters(identity, Arc::new(IngestCounters::default()))
    }

    pub fn with_counters(identity: QueryIdentity, counters: Arc<IngestCounters>) -> Self {
        Self {
            identity,
            entries: DashMap::new(),
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            counters,
        }
    }

    pub fn identity(&self) -> QueryIdentity {
        self.identity
    }

    /// Registers a query and returns a handle onto its working set.
    ///
    /// With structural identity an equal, still-registered query's working set is
    /// reused.
    pub fn register<P>(&self, predicate: P) -> QueryHandle
    where
        P: ListingPredicate + 'static,
    {
        self.register_shared(Arc::new(predicate))
    }

    pub fn register_shared(&self, predicate: Arc<dyn ListingPredicate>) -> QueryHandle {
        let handle = QueryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let key = match self.identity {
            QueryIdentity::Structural => predicate.fingerprint(),
            QueryIdentity::Reference => format!("#{}", handle.0),
        };

        // The shard stays write-locked while the handle is added, so a concurrent
        // unregister cannot drop the entry in between.
        {
            let entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(QueryEntry::new(predicate)));
            let mut handles = entry.handles.lock().unwrap_or_else(PoisonError::into_inner);
            handles.insert(handle);
            log::info!("Registered {} ({} handle(s) on its working set)", handle, handles.len());
        }
        self.handles.insert(handle, key);
        handle
    }

    /// Releases a handle. Returns `false` when it was not (or no longer) registered.
    pub fn unregister(&self, handle: QueryHandle) -> bool {
        let Some((_, key)) = self.handles.remove(&handle) else {
            log::debug!("Unregister of unknown handle {} ignored", handle);
            return false;
        };

        let removed = self.entries.remove_if(&key, |_, entry| {
            let mut handles = entry.handles.lock().unwrap_or_else(PoisonError::into_inner);
            handles.remove(&handle);
            handles.is_empty()
        });

        if removed.is_some() {
            log::info!("Unregistered {}; working set released", handle);
        } else {
            log::info!("Unregistered {}; working set still shared", handle);
        }
        true
    }

    fn entry_for(&self, handle: QueryHandle) -> Option<Arc<QueryEntry>> {
        let key = self.handles.get(&handle)?.value().clone();
        self.entries.get(&key).map(|e| Arc::clone(e.value()))
    }

    pub fn is_registered(&self, handle: QueryHandle) -> bool {
        self.handles.contains_key(&handle)
    }

    /// Number of distinct working sets.
    pub fn query_count(&self) -> usize {
        self.entries.len()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Copies the current working set under a fresh correlation id.
    pub fn issue_snapshot(&self, handle: QueryHandle) -> Option<ResultSet> {
        let entry = self.entry_for(handle)?;
        let working_set = entry.working_set.read().unwrap_or_else(PoisonError::into_inner);
        let mut listings: Vec<Listing> = working_set.values().cloned().collect();
        let revision = *entry.revision.borrow();
        drop(working_set);

        listings.sort_by(|a, b| a.id.cmp(&b.id));
        Some(ResultSet {
            id: Uuid::new_v4(),
            handle,
            revision,
            listings,
        })
    }

    /// Revision feed for a handle's working set.
    pub fn watch(&self, handle: QueryHandle) -> Option<watch::Receiver<u64>> {
        self.entry_for(handle).map(|e| e.revision.subscribe())
    }

    /// Matches a decoded batch against every registered query and unions the
    /// matches into the working sets (last write wins per identity).
    pub fn ingest(&self, batch: &[Listing]) -> FanOutReport {
        let entries: Vec<Arc<QueryEntry>> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        let mut report = FanOutReport {
            queries: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            let mut matched = Vec::new();
            let mut errors = 0usize;
            let mut last_error = None;

            for listing in batch {
                match contain_panic(|| entry.predicate.evaluate(listing), IngestError::Predicate) {
                    Ok(true) => matched.push(listing),
                    Ok(false) => {}
                    Err(e) => {
                        errors += 1;
                        last_error = Some(e);
                    }
                }
            }

            if let Some(e) = last_error {
                log::warn!(
                    "Predicate {} failed on {} listing(s), last error: {}",
                    entry.predicate.fingerprint(),
                    errors,
                    e
                );
                report.predicate_errors += errors;
            }

            if matched.is_empty() {
                continue;
            }
            report.matched += matched.len();
            {
                let mut working_set = entry.working_set.write().unwrap_or_else(PoisonError::into_inner);
                for listing in matched {
                    working_set.insert(listing.id.clone(), listing.clone());
                }
            }
            entry.revision.send_modify(|rev| *rev += 1);
        }

        IngestCounters::add(&self.counters.matches, report.matched as u64);
        IngestCounters::add(&self.counters.predicate_errors, report.predicate_errors as u64);
        report
    }
}

/// Feeds a query's working set into a diff tracker.
///
/// In `wait_for_change` mode the source is only ready again once the working
/// set's revision moved, which makes a live-mode tracker event driven.
pub struct RegistrySnapshotSource {
    registry: Arc<QueryMatchRegistry>,
    handle: QueryHandle,
    revision: Option<tokio::sync::Mutex<watch::Receiver<u64>>>,
}

impl RegistrySnapshotSource {
    pub fn new(registry: Arc<QueryMatchRegistry>, handle: QueryHandle) -> Self {
        Self {
            registry,
            handle,
            revision: None,
        }
    }

    pub fn wait_for_change(registry: Arc<QueryMatchRegistry>, handle: QueryHandle) -> IngestResult<Self> {
        let mut rx = registry
            .watch(handle)
            .ok_or(IngestError::NotRegistered(handle.id()))?;
        // Ready at once for the current state; afterwards only on a change.
        rx.mark_changed();
        Ok(Self {
            registry,
            handle,
            revision: Some(tokio::sync::Mutex::new(rx)),
        })
    }
}

#[async_trait]
impl ListingSource for RegistrySnapshotSource {
    async fn fetch(&self) -> IngestResult<Vec<Listing>> {
        self.registry
            .issue_snapshot(self.handle)
            .map(|set| set.listings)
            .ok_or(IngestError::NotRegistered(self.handle.id()))
    }

    async fn ready(&self) -> IngestResult<()> {
        match &self.revision {
            Some(revision) => {
                let mut rx = revision.lock().await;
                rx.changed()
                    .await
                    .map_err(|_| IngestError::NotRegistered(self.handle.id()))?;
            }
            None => tokio::task::yield_now().await,
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("working set {}", self.handle)
    }
}
