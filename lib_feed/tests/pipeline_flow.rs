use async_trait::async_trait;
use lib_feed::{
    ChangeFeedSource, ChangeId, CursorSeed, FeedPage, FeedPipeline, IngestError, IngestResult, IngestSettings,
    JsonListingDecoder, Listing, ListingGroup, ListingPredicate, ListingState, Query, QueuePolicy, RefreshMode,
    TrackerOptions,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serves scripted pages, then empty ones at the last cursor.
struct ScriptedFeed {
    pages: Mutex<VecDeque<IngestResult<FeedPage>>>,
    requested: Mutex<Vec<String>>,
}

impl ScriptedFeed {
    fn new(pages: Vec<IngestResult<FeedPage>>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages.into()),
            requested: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChangeFeedSource for ScriptedFeed {
    async fn fetch_page(&self, cursor: &ChangeId) -> IngestResult<FeedPage> {
        self.requested.lock().unwrap().push(cursor.to_string());
        self.pages.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(FeedPage {
                next_change_id: cursor.clone(),
                stashes: vec![],
            })
        })
    }
}

struct Seed(IngestResult<ChangeId>);

#[async_trait]
impl CursorSeed for Seed {
    fn name(&self) -> String {
        "scripted".into()
    }

    async fn fetch_cursor(&self) -> IngestResult<ChangeId> {
        self.0.clone()
    }
}

fn group(id: &str, league: &str, items: Vec<serde_json::Value>) -> ListingGroup {
    ListingGroup {
        id: id.into(),
        account_name: Some("seller".into()),
        league: Some(league.into()),
        items,
        ..Default::default()
    }
}

fn settings() -> IngestSettings {
    IngestSettings {
        poll_interval_ms: 100,
        min_request_interval_ms: 50,
        queue: QueuePolicy::Bounded(2),
        ..Default::default()
    }
}

#[derive(Debug)]
struct PanickingPredicate;

impl ListingPredicate for PanickingPredicate {
    fn fingerprint(&self) -> String {
        "panicking".into()
    }

    fn evaluate(&self, _listing: &Listing) -> Result<bool, IngestError> {
        panic!("predicate bug")
    }
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_feed_reaches_only_matching_query() {
    let feed = ScriptedFeed::new(vec![Ok(FeedPage {
        next_change_id: "2-2".into(),
        stashes: vec![
            group("s1", "Standard", vec![json!({"id": "1", "typeLine": "Gold Ring"})]),
            group("s2", "Hardcore", vec![json!({"id": "2", "typeLine": "Gold Ring"})]),
        ],
    })]);
    let seeds: Vec<Arc<dyn CursorSeed>> = vec![
        Arc::new(Seed(Err(IngestError::Network("down".into())))),
        Arc::new(Seed(Ok("1-1".into()))),
    ];
    let pipeline = FeedPipeline::new(&settings(), feed.clone(), seeds, Arc::new(JsonListingDecoder));
    let registry = pipeline.registry();
    let standard = registry.register(Query::league("Standard"));
    let everything = registry.register(Query::default());

    pipeline.start().unwrap();
    assert!(pipeline.start().is_err());

    eventually(|| registry.issue_snapshot(everything).map(|s| s.listings.len()) == Some(2)).await;

    let snapshot = registry.issue_snapshot(standard).unwrap();
    let ids: Vec<&str> = snapshot.listings.iter().map(|l| l.id.as_str()).collect();
    assert_eq!(ids, vec!["1"]);
    assert_eq!(snapshot.listings[0].seller.as_deref(), Some("seller"));

    assert_eq!(pipeline.poller().cursor().await, Some("2-2".into()));
    eventually(|| feed.requested.lock().unwrap().len() >= 2).await;
    let requested = feed.requested.lock().unwrap().clone();
    assert_eq!(&requested[..2], &["1-1".to_string(), "2-2".to_string()]);

    let counters = pipeline.counters();
    assert_eq!(counters.batches_decoded, 1);
    assert_eq!(counters.listings_decoded, 2);

    pipeline.shutdown().await;
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_panicking_predicate_does_not_stop_ingestion() {
    let pages = (1..=3)
        .map(|i| {
            Ok(FeedPage {
                next_change_id: i.to_string().into(),
                stashes: vec![group("s", "Standard", vec![json!({"id": format!("L{}", i)})])],
            })
        })
        .collect();
    let mut settings = settings();
    settings.initial_cursor = Some("0".into());
    let pipeline = FeedPipeline::new(&settings, ScriptedFeed::new(pages), vec![], Arc::new(JsonListingDecoder));
    let registry = pipeline.registry();
    let good = registry.register(Query::default());
    let bad = registry.register(PanickingPredicate);

    pipeline.start().unwrap();
    eventually(|| registry.issue_snapshot(good).map(|s| s.listings.len()) == Some(3)).await;
    assert!(registry.issue_snapshot(bad).unwrap().listings.is_empty());
    assert_eq!(pipeline.poller().cursor().await, Some("3".into()));
    assert_eq!(pipeline.counters().predicate_errors, 3);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_live_tracker_over_working_set() {
    let feed = ScriptedFeed::new(vec![
        Ok(FeedPage {
            next_change_id: "1".into(),
            stashes: vec![group("s", "Standard", vec![json!({"id": "A"}), json!({"id": "B"})])],
        }),
        Ok(FeedPage {
            next_change_id: "2".into(),
            stashes: vec![group("s", "Standard", vec![json!({"id": "C"})])],
        }),
    ]);
    let mut settings = settings();
    settings.initial_cursor = Some("0".into());
    let pipeline = FeedPipeline::new(&settings, feed, vec![], Arc::new(JsonListingDecoder));
    let registry = pipeline.registry();
    let q = registry.register(Query::league("Standard"));

    let tracker = pipeline
        .attach_tracker(
            q,
            TrackerOptions {
                mode: RefreshMode::Live,
                ..Default::default()
            },
        )
        .unwrap();
    let mut rx = tracker.subscribe();
    pipeline.start().unwrap();

    // Working sets only grow, so the tracker only ever reports New here.
    let mut seen = Vec::new();
    while seen.len() < 3 {
        let update = rx.recv().await.unwrap();
        for listing in &update.listings {
            assert_eq!(listing.state, ListingState::New);
            seen.push(listing.id.to_string());
        }
    }
    seen.sort();
    assert_eq!(seen, vec!["A", "B", "C"]);

    tracker.dispose().await;
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_tracker_needs_registered_handle() {
    let pipeline = FeedPipeline::new(&settings(), ScriptedFeed::new(vec![]), vec![], Arc::new(JsonListingDecoder));
    let registry = pipeline.registry();
    let q = registry.register(Query::default());
    registry.unregister(q);

    assert!(matches!(
        pipeline.attach_tracker(q, TrackerOptions::default()),
        Err(IngestError::NotRegistered(_))
    ));
}
