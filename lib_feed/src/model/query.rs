//! # Query descriptors
//!
//! A `Query` is an immutable, structurally comparable filter. Anything that can
//! decide whether a listing matches can be registered by implementing
//! `ListingPredicate`; `Query` is simply the built-in implementation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::IngestError;
use crate::model::listing::Listing;

/// Decides whether a listing belongs to a query's working set.
pub trait ListingPredicate: Send + Sync + fmt::Debug {
    /// Structural identity. Two predicates with the same fingerprint share a
    /// working set when the registry runs with structural identity.
    fn fingerprint(&self) -> String;

    /// Evaluates one listing. An error only affects this predicate's update.
    fn evaluate(&self, listing: &Listing) -> Result<bool, IngestError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Query {
    /// Exact league (region) match, case-insensitive.
    pub league: Option<String>,
    /// Case-insensitive substring of the display name.
    pub name_contains: Option<String>,
    /// Every entry must appear (case-insensitive substring) in at least one modifier.
    pub modifiers: Vec<String>,
    /// Upper bound on the asking price, in whole units of `currency`.
    pub max_price: Option<u64>,
    /// Required price currency. Unpriced listings never match when set.
    pub currency: Option<String>,
}

impl Query {
    pub fn league(league: impl Into<String>) -> Self {
        Self {
            league: Some(league.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, needle: impl Into<String>) -> Self {
        self.name_contains = Some(needle.into());
        self
    }

    pub fn with_modifier(mut self, needle: impl Into<String>) -> Self {
        self.modifiers.push(needle.into());
        self
    }

    pub fn with_max_price(mut self, amount: u64, currency: impl Into<String>) -> Self {
        self.max_price = Some(amount);
        self.currency = Some(currency.into());
        self
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        if let Some(league) = &self.league {
            if !league.eq_ignore_ascii_case(&listing.league) {
                return false;
            }
        }

        if let Some(needle) = &self.name_contains {
            if !contains_ignore_case(&listing.name, needle) {
                return false;
            }
        }

        let mods_ok = self.modifiers.iter().all(|needle| {
            listing
                .modifiers
                .iter()
                .any(|m| contains_ignore_case(m, needle))
        });
        if !mods_ok {
            return false;
        }

        if self.currency.is_none() && self.max_price.is_none() {
            return true;
        }
        let Some(price) = &listing.price else {
            return false;
        };
        if let Some(currency) = &self.currency {
            if !currency.eq_ignore_ascii_case(&price.currency) {
                return false;
            }
        }
        match self.max_price {
            Some(max) => price.amount <= max as f64,
            None => true,
        }
    }
}

impl ListingPredicate for Query {
    fn fingerprint(&self) -> String {
        format!("{:?}", self)
    }

    fn evaluate(&self, listing: &Listing) -> Result<bool, IngestError> {
        Ok(self.matches(listing))
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
