//! # Live-Notify Session
//!
//! Session-oriented long-poll client. A session first runs an initial request
//! that yields the current result set and a session id, then repeatedly posts
//! its continuation token to the derived session URI and receives listings that
//! appeared since the previous exchange.
//!
//! ## Key Design Principles:
//! - **Explicit state machine**: every transition goes through
//!   `SessionState::on`. The loop only decides which trigger to fire.
//! - **Recovery by re-bootstrap**: a failed bootstrap retries on the next cycle, a
//!   failed exchange (network, HTTP, missing `newid`) drops back to the initial
//!   request. Both failures are published to subscribers.
//! - **Terminal violations**: a trigger the current state does not handle is
//!   published to every subscriber and ends the session.
//! - **Replay**: output goes through a `Dispatcher` that keeps the most recent
//!   events for late subscribers.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::core::diff_tracker::ListingUpdate;
use crate::core::dispatcher::{Dispatcher, Subscription};
use crate::decode::{DecodeContext, NotifyPayloadDecoder};
use crate::error::{contain_panic, IngestError, IngestResult};
use crate::ingestors::session_state::{SessionState, SessionTrigger};
use crate::model::listing::{Listing, ListingState};

/// Answer to the initial request of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapReply {
    /// Session id the live URI is derived from.
    #[serde(default)]
    pub id: Option<String>,
    /// Current result set, in the payload decoder's format.
    #[serde(default)]
    pub data: String,
}

/// Body of one live exchange: `{ "newid", "count", "data" }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyReply {
    #[serde(default)]
    pub newid: Option<String>,
    #[serde(default)]
    pub count: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

#[async_trait]
pub trait LiveNotifyTransport: Send + Sync {
    async fn bootstrap(&self) -> IngestResult<BootstrapReply>;

    /// Session URI for a bootstrap id, `None` if it cannot be derived.
    fn session_uri(&self, session_id: &str) -> Option<String>;

    /// Posts `token` to the session URI.
    async fn exchange(&self, session_uri: &str, token: &str) -> IngestResult<NotifyReply>;

    fn describe(&self) -> String {
        "live notify".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct LiveNotifyOptions {
    /// Pause between two cycles.
    pub poll_delay: Duration,
    /// Number of past events replayed to late subscribers.
    pub replay: usize,
    /// League stamped on listings whose payload does not carry one.
    pub league: Option<String>,
}

impl Default for LiveNotifyOptions {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_secs(1),
            replay: 16,
            league: None,
        }
    }
}

struct SessionShared {
    name: String,
    transport: Arc<dyn LiveNotifyTransport>,
    decoder: Arc<dyn NotifyPayloadDecoder>,
    context: DecodeContext,
    poll_delay: Duration,
    state: Mutex<SessionState>,
    dispatcher: Dispatcher<ListingUpdate>,
    cancel: CancellationToken,
}

pub struct LiveNotifySession {
    shared: Arc<SessionShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveNotifySession {
    /// Creates the session in `Created` and starts its loop.
    pub fn spawn(
        name: impl Into<String>,
        transport: Arc<dyn LiveNotifyTransport>,
        decoder: Arc<dyn NotifyPayloadDecoder>,
        options: LiveNotifyOptions,
    ) -> Self {
        let name = name.into();
        let context = DecodeContext {
            league: options.league.clone(),
            ..Default::default()
        }
        .with_origin(format!("live:{}", name));

        let shared = Arc::new(SessionShared {
            dispatcher: Dispatcher::new(format!("live:{}", name), options.replay),
            name,
            transport,
            decoder,
            context,
            poll_delay: options.poll_delay,
            state: Mutex::new(SessionState::Created),
            cancel: CancellationToken::new(),
        });

        let task = tokio::spawn(run_session(Arc::clone(&shared)));
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

    pub fn state(&self) -> SessionState {
        self.shared.lock_state().clone()
    }

    /// Fires a trigger from outside the loop. An unhandled trigger terminates
    /// the session.
    pub fn fire(&self, trigger: SessionTrigger) -> IngestResult<SessionState> {
        self.shared.fire(trigger)
    }

    /// Disposes the session, stops the loop and ends subscriber streams.
    /// Safe to call more than once.
    pub async fn dispose(&self) {
        if let Err(e) = self.shared.fire(SessionTrigger::Dispose) {
            log::error!("[{}] dispose rejected: {}", self.shared.name, e);
        }
        self.shared.cancel.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("[{}] session task ended abnormally: {}", self.shared.name, e);
            }
        }
        self.shared.dispatcher.close();
    }
}

impl Drop for LiveNotifySession {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl SessionShared {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, trigger: SessionTrigger) -> IngestResult<SessionState> {
        let mut state = self.lock_state();
        let from = state.name();
        let trigger_name = trigger.name();

        match state.clone().on(trigger) {
            Ok(next) => {
                if from != next.name() {
                    log::info!("[{}] {} --{}--> {}", self.name, from, trigger_name, next);
                } else {
                    log::debug!("[{}] {} --{}--> {}", self.name, from, trigger_name, next);
                }
                *state = next.clone();
                Ok(next)
            }
            Err(violation) => {
                *state = SessionState::Disposed;
                drop(state);
                log::error!("[{}] {}. Terminating session", self.name, violation);
                self.publish(Vec::new(), Some(violation.clone()));
                self.cancel.cancel();
                self.dispatcher.close();
                Err(violation)
            }
        }
    }

    fn publish(&self, listings: Vec<Listing>, error: Option<IngestError>) {
        self.dispatcher.broadcast(ListingUpdate {
            listings,
            is_busy: false,
            last_error: error,
            last_update: Some(Utc::now()),
        });
    }

    /// Initial request. Publishes the current result set and derives the
    /// session URI.
    async fn bootstrap(&self) -> IngestResult<String> {
        let reply = self.transport.bootstrap().await?;
        let listings = contain_panic(|| self.decoder.decode_payload(&reply.data, &self.context), IngestError::Decode)?;
        log::info!("[{}] bootstrap returned {} listing(s)", self.name, listings.len());
        self.publish(listings, None);

        let id = reply
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| IngestError::Protocol("initial response carried no session id".into()))?;
        self.transport
            .session_uri(&id)
            .ok_or_else(|| IngestError::Protocol(format!("no session URI for id {}", id)))
    }

    /// One live exchange. Returns the next continuation token.
    async fn exchange(&self, uri: &str, token: &str) -> IngestResult<String> {
        let reply = self.transport.exchange(uri, token).await?;

        let next = reply
            .newid
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| IngestError::Protocol("live reply carried no newid".into()))?;

        let data = reply.data.unwrap_or_default();
        let listings: Vec<Listing> = contain_panic(|| self.decoder.decode_payload(&data, &self.context), IngestError::Decode)?
            .into_iter()
            .map(|l| l.with_state(ListingState::New))
            .collect();

        if let Some(count) = reply.count.as_deref().and_then(|c| c.trim().parse::<usize>().ok()) {
            if count != listings.len() {
                log::debug!(
                    "[{}] reply announced {} listing(s), decoded {}",
                    self.name,
                    count,
                    listings.len()
                );
            }
        }

        if !listings.is_empty() {
            log::debug!("[{}] {} new listing(s)", self.name, listings.len());
            self.publish(listings, None);
        }
        Ok(next)
    }

    /// Runs the cycle for the current state. Only a state violation is returned.
    async fn cycle(&self) -> IngestResult<()> {
        let state = self.lock_state().clone();
        match state {
            SessionState::Created => self.fire(SessionTrigger::Create).map(|_| ()),
            SessionState::AwaitingInitialRequest => match self.bootstrap().await {
                Ok(uri) => self.fire(SessionTrigger::LiveQueryStarted(uri)).map(|_| ()),
                Err(e) => {
                    log::warn!("[{}] initial request failed: {}", self.name, e);
                    self.publish(Vec::new(), Some(e));
                    self.fire(SessionTrigger::ReceivedUnexpectedInitialResponse).map(|_| ())
                }
            },
            SessionState::LiveQuery { uri, token } => match self.exchange(&uri, &token).await {
                Ok(next) => self.fire(SessionTrigger::LiveQuerySucceeded(next)).map(|_| ()),
                Err(e) => {
                    log::warn!("[{}] live exchange failed: {}. Re-bootstrapping", self.name, e);
                    self.publish(Vec::new(), Some(e));
                    self.fire(SessionTrigger::LiveQueryFailed).map(|_| ())
                }
            },
            SessionState::Disposed => Ok(()),
        }
    }
}

async fn run_session(shared: Arc<SessionShared>) {
    log::info!("[{}] live session started on {}", shared.name, shared.transport.describe());

    loop {
        if shared.lock_state().is_disposed() {
            break;
        }
        let was_created = matches!(*shared.lock_state(), SessionState::Created);

        let step = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            step = shared.cycle() => step,
        };
        if step.is_err() {
            break;
        }
        if was_created {
            continue;
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = sleep(shared.poll_delay) => {}
        }
    }

    log::info!("[{}] live session stopped", shared.name);
}
