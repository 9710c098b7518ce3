//! # Feed page wire format
//!
//! One response of the public change feed. Items are kept as raw JSON so the
//! network loop never pays for decoding; the decode worker turns them into
//! `Listing`s later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::change_id::ChangeId;

/// Body of `GET <feed>?id=<cursor>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedPage {
    pub next_change_id: ChangeId,
    #[serde(default)]
    pub stashes: Vec<ListingGroup>,
}

/// A container of listings (one seller's stash tab).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingGroup {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub account_name: Option<String>,
    /// Tab name. Sellers often put a price note here that applies to every item.
    #[serde(default)]
    pub stash: Option<String>,
    #[serde(default)]
    pub league: Option<String>,
    #[serde(default)]
    pub items: Vec<Value>,
}

/// A fetched page waiting in the decode queue.
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// Cursor the page was requested with.
    pub cursor: ChangeId,
    /// Cursor adopted after this page.
    pub next_cursor: ChangeId,
    pub groups: Vec<ListingGroup>,
    pub received_at: DateTime<Utc>,
}

impl RawBatch {
    pub fn listing_count(&self) -> usize {
        self.groups.iter().map(|g| g.items.len()).sum()
    }
}
