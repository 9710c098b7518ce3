use anyhow::{Context, Result};
use lib_feed::retrieve::HttpLiveNotifyTransport;
use lib_feed::{
    FeedPipeline, IngestSettings, JsonNotifyPayloadDecoder, LiveDiffTracker, LiveNotifySession, RefreshMode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;

mod feed_logic;
use feed_logic::{config, consumer, logger};

fn start_live_session(settings: &IngestSettings) -> Result<Option<LiveNotifySession>> {
    let Some(live) = &settings.live else {
        return Ok(None);
    };

    let transport = HttpLiveNotifyTransport::new(
        &live.bootstrap_url,
        live.session_uri_template.clone(),
        &live.cookies,
        settings.http.client_options(&live.headers),
    )
    .context("failed to build live-notify transport")?;

    let session = LiveNotifySession::spawn(
        "live",
        Arc::new(transport),
        Arc::new(JsonNotifyPayloadDecoder::default()),
        live.live_options(),
    );
    log::info!("Live-notify session started against {}", live.bootstrap_url);
    Ok(Some(session))
}

async fn wait_for_signal() {
    tokio::select! {
        res = signal::ctrl_c() => {
            match res {
                Ok(()) => log::info!("Ctrl-C received, initiating shutdown."),
                Err(e) => log::error!("Failed to listen for Ctrl-C: {}. Shutting down.", e),
            }
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), &config.log_level())?;

    let settings = config.to_settings().context("invalid ingestion settings")?;
    let pipeline = Arc::new(FeedPipeline::from_settings(&settings)?);
    let registry = pipeline.registry();

    let mut trackers: Vec<LiveDiffTracker> = Vec::new();
    let mut consumers: Vec<JoinHandle<usize>> = Vec::new();

    for (index, query) in config.queries().into_iter().enumerate() {
        log::info!("Registering query #{}: {:?}", index, query);
        let handle = registry.register(query);
        let tracker = pipeline.attach_tracker(handle, settings.tracker_options())?;
        consumers.push(tokio::spawn(consumer::log_updates(
            format!("query-{}", index),
            tracker.subscribe(),
        )));
        trackers.push(tracker);
    }
    if trackers.is_empty() {
        log::warn!("No queries configured; the feed is ingested but nothing is tracked.");
    }

    let live = start_live_session(&settings)?;
    if let Some(session) = &live {
        consumers.push(tokio::spawn(consumer::log_updates(
            session.name().to_string(),
            session.subscribe(),
        )));
    }

    pipeline.start()?;

    // Manual trackers only move when asked; take one snapshot at startup.
    for tracker in trackers.iter().filter(|t| t.mode() == RefreshMode::Manual) {
        tracker.refresh();
    }

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let status_handle = tokio::spawn(consumer::report_status(
        Arc::clone(&pipeline),
        Duration::from_secs(config.status_interval_seconds.unwrap_or(60).max(1)),
        shutdown_tx.subscribe(),
    ));

    wait_for_signal().await;

    // Reverse start order: status log, feed, live session, trackers.
    let _ = shutdown_tx.send(());
    let _ = status_handle.await;

    pipeline.shutdown().await;

    if let Some(session) = &live {
        session.dispose().await;
    }
    for tracker in &trackers {
        tracker.dispose().await;
    }
    for handle in consumers {
        let _ = handle.await;
    }

    let c = pipeline.counters();
    log::info!(
        "Shutdown complete. polls={} batches={} listings={} matches={}",
        c.polls,
        c.batches_decoded,
        c.listings_decoded,
        c.matches
    );
    Ok(())
}
