//! # Ingestion Errors
//!
//! One error taxonomy for the whole pipeline. The variants map onto how far a
//! failure is allowed to travel:
//!
//! - **`Network` / `Http`**: transport failures. Isolated to one fetch cycle.
//! - **`Protocol`**: the upstream answered but broke its contract (missing next
//!   token, regressing cursor). Retried next tick by the feed poller, surfaced to
//!   subscribers by the live-notify session.
//! - **`Decode`**: one malformed listing. Dropped and counted, never raised past the batch.
//! - **`StateViolation`**: a trigger with no transition from the current session
//!   state. Terminal for that session.
//!
//! The enum is `Clone` so the most recent failure can be stored on a tracker and
//! broadcast to every subscriber.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("failed to decode listing: {0}")]
    Decode(String),

    #[error("no transition from state {state} on trigger {trigger}")]
    StateViolation { state: String, trigger: String },

    #[error("cursor bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("query predicate failed: {0}")]
    Predicate(String),

    #[error("batch queue is closed")]
    QueueClosed,

    #[error("query handle {0} is not registered")]
    NotRegistered(u64),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IngestError {
    /// True for failures the enclosing loop should simply retry on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::Network(_) | IngestError::Http { .. } | IngestError::Bootstrap(_)
        )
    }
}

/// Runs pluggable client code (predicates, decoders) so that a panic inside it
/// becomes an ordinary error built by `on_panic` instead of unwinding through the
/// worker that called it.
pub(crate) fn contain_panic<T>(
    f: impl FnOnce() -> Result<T, IngestError>,
    on_panic: fn(String) -> IngestError,
) -> Result<T, IngestError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(on_panic(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::Protocol(format!("malformed JSON body: {}", e))
    }
}

#[cfg(feature = "retrieve")]
impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            IngestError::Protocol(e.to_string())
        } else {
            IngestError::Network(e.to_string())
        }
    }
}

#[cfg(feature = "retrieve")]
impl From<reqwest_middleware::Error> for IngestError {
    fn from(e: reqwest_middleware::Error) -> Self {
        match e {
            reqwest_middleware::Error::Reqwest(inner) => inner.into(),
            other => IngestError::Network(other.to_string()),
        }
    }
}

#[cfg(feature = "retrieve")]
impl From<url::ParseError> for IngestError {
    fn from(e: url::ParseError) -> Self {
        IngestError::Config(format!("invalid URL: {}", e))
    }
}
