//! # Core Engine Module
//!
//! The stages between the network and the consumer, plus the plumbing they
//! share. Everything here is asynchronous and thread-safe.
//!
//! ## Core Components:
//!
//! - **`rate_gate`**: token bucket of one that spaces feed requests.
//! - **`decode_queue`**: the bounded (or explicitly unbounded) handoff from the
//!   poller to the single decode worker; the backpressure boundary.
//! - **`registry`**: active client queries and their deduplicated working sets.
//! - **`diff`**: New/Removed classification against an existing-items set.
//! - **`diff_tracker`**: supervised refresh loop (manual, periodic, live) around a
//!   listing source, publishing diffs.
//! - **`dispatcher`**: zero-copy broadcaster with replay for late subscribers.
//! - **`monitor`**: shared pipeline counters and decode backlog accounting.
//! - **`pipeline`**: wires the stages together and owns their tasks.

/// Minimum spacing between outbound requests.
pub mod rate_gate;
/// Poller to decoder handoff and the decode worker.
pub mod decode_queue;
/// Query registration and working sets.
pub mod registry;
/// New/Removed diffing.
pub mod diff;
/// Supervised diff tracker.
pub mod diff_tracker;
/// Broadcaster with replay.
pub mod dispatcher;
/// Pipeline counters and decode backlog accounting.
pub mod monitor;
/// Stage wiring and teardown.
pub mod pipeline;

// --- Public API Re-exports ---
pub use decode_queue::{batch_queue, BatchReceiver, BatchSender, DecodeWorker, QueuePolicy};
pub use diff::ExistingItems;
pub use diff_tracker::{LiveDiffTracker, ListingSource, ListingUpdate, RefreshMode, TrackerOptions, TrackerStatus};
pub use dispatcher::{Dispatcher, Subscription};
pub use monitor::{BacklogGuard, CounterSnapshot, IngestCounters};
pub use pipeline::FeedPipeline;
pub use rate_gate::RequestGate;
pub use registry::{FanOutReport, QueryHandle, QueryIdentity, QueryMatchRegistry, RegistrySnapshotSource, ResultSet};
