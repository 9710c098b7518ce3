//! Log-only consumers for tracker and live-session streams.

use lib_feed::{FeedPipeline, Listing, ListingState, ListingUpdate, Subscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Drains one update stream until its producer closes it.
///
/// Returns the number of updates seen.
pub async fn log_updates(name: String, mut updates: Subscription<ListingUpdate>) -> usize {
    let mut seen = 0;
    while let Some(update) = updates.recv().await {
        seen += 1;
        if let Some(e) = &update.last_error {
            log::warn!("[{}] refresh failed: {}", name, e);
            continue;
        }
        if update.is_busy {
            continue;
        }
        for listing in update.listings.iter() {
            log::info!("[{}] {}", name, describe(listing));
        }
    }
    log::info!("[{}] stream closed after {} updates", name, seen);
    seen
}

fn describe(listing: &Listing) -> String {
    let tag = match listing.state {
        ListingState::New => "NEW",
        ListingState::Removed => "GONE",
        ListingState::Unknown => "SEEN",
    };
    let price = listing
        .price
        .as_ref()
        .map(|p| format!(" @ {} {}", p.amount, p.currency))
        .unwrap_or_default();
    format!("{} {} [{}]{} ({})", tag, listing.name, listing.league, price, listing.id)
}

/// Logs the pipeline counters every `every` until shutdown.
pub async fn report_status(pipeline: Arc<FeedPipeline>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {
                let c = pipeline.counters();
                let cursor = pipeline.poller().cursor().await;
                log::info!(
                    "cursor={} polls={} empty={} failed={} batches={} decoded={} dropped={} matches={} predicate_errors={} backlog={}",
                    cursor.as_ref().map_or("<unseeded>", |id| id.as_str()),
                    c.polls,
                    c.empty_polls,
                    c.failed_polls,
                    c.batches_decoded,
                    c.listings_decoded,
                    c.listings_dropped,
                    c.matches,
                    c.predicate_errors,
                    pipeline.backlog().pending(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_feed::{Dispatcher, Price};

    #[test]
    fn test_describe_shows_state_and_price() {
        let listing = Listing::new("x1", "Standard", "Gold Ring")
            .with_price(Price {
                amount: 2.0,
                currency: "chaos".into(),
            })
            .with_state(ListingState::New);
        assert_eq!(describe(&listing), "NEW Gold Ring [Standard] @ 2 chaos (x1)");
    }

    #[tokio::test]
    async fn test_log_updates_ends_with_stream() {
        let dispatcher = Dispatcher::<ListingUpdate>::new("test", 0);
        let handle = tokio::spawn(log_updates("test".into(), dispatcher.subscribe()));

        dispatcher.broadcast(ListingUpdate::default());
        dispatcher.broadcast(ListingUpdate::default());
        dispatcher.close();

        assert_eq!(handle.await.unwrap(), 2);
    }
}
