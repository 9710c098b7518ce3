//! # Data Ingestors Module
//!
//! The two ways listings enter the system. Each submodule owns the protocol
//! logic of one source and talks to the network only through a transport trait,
//! so the HTTP adapters in `retrieve` (or scripted fakes in tests) can be plugged
//! in.
//!
//! ## Contained Modules:
//! - **`change_feed`**: the rate-limited, cursor-advancing poller of the public
//!   change feed. Raw pages go to the decode queue.
//! - **`session_state`**: the live-notify session protocol as an enum state machine.
//! - **`live_notify`**: the long-poll session loop that drives that state machine
//!   and publishes listings to subscribers.

/// Cursor-paginated change feed poller.
pub mod change_feed;
/// Live-notify long-poll session.
pub mod live_notify;
/// Session protocol state machine.
pub mod session_state;

pub use change_feed::{ChangeFeedPoller, ChangeFeedSource, CursorSeed, PollOutcome, PollerOptions};
pub use live_notify::{BootstrapReply, LiveNotifyOptions, LiveNotifySession, LiveNotifyTransport, NotifyReply};
pub use session_state::{SessionState, SessionTrigger, INITIAL_TOKEN};
