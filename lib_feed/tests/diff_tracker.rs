use async_trait::async_trait;
use lib_feed::{
    IngestError, IngestResult, LiveDiffTracker, Listing, ListingSource, ListingState, ListingUpdate, Query,
    QueryIdentity, QueryMatchRegistry, RefreshMode, RegistrySnapshotSource, Subscription, TrackerOptions,
};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Replays scripted results, then keeps returning the last successful batch.
struct ScriptedSource {
    script: Mutex<VecDeque<IngestResult<Vec<Listing>>>>,
    last: Mutex<Vec<Listing>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedSource {
    fn new(script: Vec<IngestResult<Vec<Listing>>>) -> Arc<Self> {
        Self::slow(script, Duration::ZERO)
    }

    fn slow(script: Vec<IngestResult<Vec<Listing>>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListingSource for ScriptedSource {
    async fn fetch(&self) -> IngestResult<Vec<Listing>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(batch)) => {
                *self.last.lock().unwrap() = batch.clone();
                Ok(batch)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }
}

fn l(id: &str) -> Listing {
    Listing::new(id, "Standard", id)
}

async fn next_settled(rx: &mut Subscription<ListingUpdate>) -> Arc<ListingUpdate> {
    loop {
        let update = rx.recv().await.expect("stream ended");
        if !update.is_busy {
            return update;
        }
    }
}

fn summary(update: &ListingUpdate) -> Vec<(String, ListingState)> {
    update.listings.iter().map(|x| (x.id.to_string(), x.state)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_one_failure() {
    let source = ScriptedSource::new(vec![Err(IngestError::Network("reset".into())), Ok(vec![l("A")])]);
    let options = TrackerOptions {
        mode: RefreshMode::Periodic(Duration::from_secs(60)),
        retry_delay: Duration::from_secs(5),
        replay: 4,
    };
    let tracker = LiveDiffTracker::spawn("retry", source.clone(), options);
    let mut rx = tracker.subscribe();
    let start = Instant::now();

    let failed = next_settled(&mut rx).await;
    assert_eq!(failed.last_error, Some(IngestError::Network("reset".into())));
    assert!(failed.listings.is_empty());
    assert!(!tracker.is_busy());

    // The pipeline is resubscribed after the retry delay; the periodic trigger
    // fires immediately on install.
    let recovered = next_settled(&mut rx).await;
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(recovered.last_error, None);
    assert_eq!(summary(&recovered), vec![("A".to_string(), ListingState::New)]);
    assert_eq!(source.calls(), 2);

    tracker.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_keeps_retrying_forever() {
    let failures = (0..5).map(|i| Err(IngestError::Http { status: 500 + i, body: String::new() })).collect();
    let source = ScriptedSource::slow(failures, Duration::from_millis(10));
    let options = TrackerOptions {
        mode: RefreshMode::Live,
        retry_delay: Duration::from_millis(100),
        replay: 0,
    };
    let tracker = LiveDiffTracker::spawn("forever", source.clone(), options);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(source.calls() > 5);
    assert_eq!(tracker.status().last_error, None);
    assert!(tracker.status().last_update.is_some());
    tracker.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_periodic_mode_diffs_each_tick() {
    let source = ScriptedSource::new(vec![Ok(vec![l("A"), l("B")]), Ok(vec![l("B"), l("C")])]);
    let options = TrackerOptions {
        mode: RefreshMode::Periodic(Duration::from_secs(1)),
        ..Default::default()
    };
    let tracker = LiveDiffTracker::spawn("periodic", source, options);
    let mut rx = tracker.subscribe();

    let first = next_settled(&mut rx).await;
    assert_eq!(
        summary(&first),
        vec![("A".to_string(), ListingState::New), ("B".to_string(), ListingState::New)]
    );

    let second = next_settled(&mut rx).await;
    assert_eq!(
        summary(&second),
        vec![("A".to_string(), ListingState::Removed), ("C".to_string(), ListingState::New)]
    );

    // Nothing changes after that.
    let third = next_settled(&mut rx).await;
    assert!(third.listings.is_empty());
    assert_eq!(tracker.status().existing_items, 2);

    tracker.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_mode_switch_replaces_trigger() {
    let source = ScriptedSource::new(vec![]);
    let tracker = LiveDiffTracker::spawn("switch", source.clone(), TrackerOptions::default());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(source.calls(), 0, "manual mode must not fetch on its own");

    tracker.set_mode(RefreshMode::Periodic(Duration::from_secs(1)));
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let periodic_calls = source.calls();
    assert!((3..=5).contains(&periodic_calls), "got {} calls", periodic_calls);

    tracker.set_mode(RefreshMode::Manual);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let settled = source.calls();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(source.calls(), settled, "old periodic trigger must be gone");
    assert_eq!(tracker.mode(), RefreshMode::Manual);

    tracker.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_live_mode_on_quiet_working_set_switches_to_manual() {
    let registry = Arc::new(QueryMatchRegistry::new(QueryIdentity::Structural));
    let handle = registry.register(Query::default());
    let source = RegistrySnapshotSource::wait_for_change(Arc::clone(&registry), handle).unwrap();
    let options = TrackerOptions {
        mode: RefreshMode::Live,
        ..Default::default()
    };
    let tracker = LiveDiffTracker::spawn("quiet", Arc::new(source), options);
    let mut rx = tracker.subscribe();

    // One read of the current state, then the live trigger idles without
    // holding the busy flag.
    let first = next_settled(&mut rx).await;
    assert!(first.listings.is_empty());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!tracker.is_busy());

    tracker.set_mode(RefreshMode::Manual);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(tracker.mode(), RefreshMode::Manual);
    assert!(!tracker.is_busy());

    registry.ingest(&[l("A")]);
    assert!(tracker.refresh());
    let refreshed = next_settled(&mut rx).await;
    assert_eq!(summary(&refreshed), vec![("A".to_string(), ListingState::New)]);

    tracker.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_mode_switch_drops_inflight_fetch() {
    let source = ScriptedSource::slow(vec![Ok(vec![l("A")])], Duration::from_secs(3_600));
    let options = TrackerOptions {
        mode: RefreshMode::Periodic(Duration::from_secs(1)),
        ..Default::default()
    };
    let tracker = LiveDiffTracker::spawn("inflight", source.clone(), options);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tracker.is_busy());

    tracker.set_mode(RefreshMode::Manual);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!tracker.is_busy());
    assert!(tracker.refresh());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(source.calls(), 2);

    tracker.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_while_busy_is_dropped() {
    let source = ScriptedSource::slow(vec![Ok(vec![l("A")])], Duration::from_secs(1));
    let tracker = LiveDiffTracker::spawn("busy", source.clone(), TrackerOptions::default());

    assert!(tracker.refresh());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tracker.is_busy());
    assert!(!tracker.refresh());
    assert!(!tracker.refresh());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(source.calls(), 1);
    assert!(!tracker.is_busy());

    tracker.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_dispose_releases_inflight_fetch() {
    let source = ScriptedSource::slow(vec![], Duration::from_secs(3_600));
    let tracker = LiveDiffTracker::spawn("dispose", source, TrackerOptions::default());
    let mut rx = tracker.subscribe();
    tracker.refresh();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let start = Instant::now();
    tracker.dispose().await;
    tracker.dispose().await;
    assert!(start.elapsed() < Duration::from_secs(1));

    while rx.recv().await.is_some() {}
    assert!(!tracker.is_busy());
}
