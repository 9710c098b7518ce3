//! # New/Removed diffing
//!
//! Classifies a fetched batch against the identities a subscription has already
//! seen. Only `Unknown` listings are compared by identity; listings the source
//! already tagged `New` or `Removed` pass straight through and do not touch the
//! existing-items set.

use std::collections::{HashMap, HashSet};

use crate::model::listing::{Listing, ListingId, ListingState};

/// Identities a subscription has reported as present.
#[derive(Debug, Clone, Default)]
pub struct ExistingItems {
    items: HashMap<ListingId, Listing>,
}

impl ExistingItems {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &ListingId) -> bool {
        self.items.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ListingId> {
        let mut ids: Vec<ListingId> = self.items.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Runs one diff cycle and returns the events to publish.
    ///
    /// Output order: pass-through listings (input order), then `Removed`
    /// (sorted by id), then `New` (input order).
    pub fn apply(&mut self, batch: Vec<Listing>) -> Vec<Listing> {
        let mut passthrough = Vec::new();
        let mut unknown = Vec::new();
        for listing in batch {
            match listing.state {
                ListingState::Unknown => unknown.push(listing),
                ListingState::New | ListingState::Removed => passthrough.push(listing),
            }
        }

        let present: HashSet<&ListingId> = unknown.iter().map(|l| &l.id).collect();

        let mut gone: Vec<ListingId> = self
            .items
            .keys()
            .filter(|id| !present.contains(id))
            .cloned()
            .collect();
        gone.sort();

        let mut removed = Vec::with_capacity(gone.len());
        for id in gone {
            if let Some(listing) = self.items.remove(&id) {
                removed.push(listing.tagged(ListingState::Removed));
            }
        }

        let mut added = Vec::new();
        for listing in unknown {
            if self.items.contains_key(&listing.id) {
                continue;
            }
            let fresh = listing.tagged(ListingState::New);
            self.items.insert(listing.id.clone(), listing);
            added.push(fresh);
        }

        passthrough.extend(removed);
        passthrough.extend(added);
        passthrough
    }
}
