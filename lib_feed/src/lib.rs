//! # lib_feed
//!
//! Ingestion core for a marketplace "for sale" change feed. Raw listing batches
//! are pulled from a cursor-paginated feed, decoded off the network loop, matched
//! against every registered client query and diffed per subscription into
//! New/Removed events. A second source speaks the session-based live-notify
//! protocol through an explicit state machine.
//!
//! ## Layout
//! - **`model`**: listings, change ids (cursors) and query descriptors.
//! - **`decode`**: pluggable listing decoders with JSON defaults.
//! - **`core`**: rate gate, decode queue, query registry, diff tracker, broadcaster and the pipeline orchestrator.
//! - **`ingestors`**: the change-feed poller and the live-notify session.
//! - **`retrieve`** (feature `retrieve`): reqwest-backed transports.
//! - **`configs`**: serde settings shared by the engine and the server binary.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod core;
pub mod decode;
pub mod error;
pub mod ingestors;
pub mod model;
#[cfg(feature = "retrieve")]
pub mod retrieve;

// Re-export everything
pub use crate::core::*;
pub use configs::settings::*;
pub use decode::*;
pub use error::{IngestError, IngestResult};
pub use ingestors::*;
pub use model::*;
