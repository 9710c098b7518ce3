//! # Data Model
//!
//! Plain data shared by every stage of the pipeline: decoded listings, feed
//! cursors and query descriptors.

/// Decoded listings, lifecycle tags and prices.
pub mod listing;
/// The feed's monotonic resumption token.
pub mod change_id;
/// Query descriptors and the predicate trait the registry evaluates.
pub mod query;
/// Raw feed pages as they come off the wire.
pub mod feed_page;

pub use change_id::ChangeId;
pub use feed_page::{FeedPage, ListingGroup, RawBatch};
pub use listing::{Listing, ListingId, ListingState, Price};
pub use query::{ListingPredicate, Query};
