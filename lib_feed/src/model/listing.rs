//! # Listing
//!
//! A single "for sale" offer as it flows through the pipeline. The identity hash
//! (`ListingId`) is the only key used for deduplication and diffing; every other
//! field is payload and may change between two arrivals of the same listing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle tag attached by the diff tracker or by a source that already knows
/// whether a listing is fresh (the live-notify session tags everything `New`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ListingState {
    /// Not yet classified. Only these listings take part in identity diffing.
    #[default]
    Unknown,
    /// Appeared since the previous snapshot.
    New,
    /// Disappeared since the previous snapshot.
    Removed,
}

/// Content hash identifying a listing upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ListingId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ListingId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Asking price parsed from the seller's note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
}

impl Price {
    /// Parses seller notes of the form `~b/o 5 chaos` or `~price 1/2 divine`.
    ///
    /// Returns `None` for anything else; an unpriced listing is still a valid listing.
    pub fn from_note(note: &str) -> Option<Self> {
        let mut parts = note.split_whitespace();
        let marker = parts.next()?;
        if marker != "~b/o" && marker != "~price" {
            return None;
        }
        let amount = parse_amount(parts.next()?)?;
        let currency = parts.next()?.to_string();
        Some(Self { amount, currency })
    }
}

fn parse_amount(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => raw.parse().ok(),
    }
}

/// A decoded listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    /// Identity hash; sole equality key for dedup and diffing.
    pub id: ListingId,
    /// League (region) the listing belongs to, e.g. `Standard` or `Hardcore`.
    pub league: String,
    /// Display name as shown to the user.
    pub name: String,
    pub price: Option<Price>,
    pub modifiers: Vec<String>,
    pub state: ListingState,
    /// Query or session the listing was produced under.
    pub origin: Option<String>,
    /// Seller account, when the source exposes it.
    pub seller: Option<String>,
}

impl Listing {
    pub fn new(id: impl Into<ListingId>, league: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            league: league.into(),
            name: name.into(),
            price: None,
            modifiers: Vec::new(),
            state: ListingState::Unknown,
            origin: None,
            seller: None,
        }
    }

    pub fn with_price(mut self, price: Price) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_modifiers(mut self, modifiers: Vec<String>) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn with_state(mut self, state: ListingState) -> Self {
        self.state = state;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Copy of this listing carrying a different lifecycle tag.
    pub fn tagged(&self, state: ListingState) -> Self {
        let mut copy = self.clone();
        copy.state = state;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_from_note() {
        assert_eq!(
            Price::from_note("~b/o 5 chaos"),
            Some(Price { amount: 5.0, currency: "chaos".into() })
        );
        assert_eq!(
            Price::from_note("~price 1/2 divine"),
            Some(Price { amount: 0.5, currency: "divine".into() })
        );
        assert_eq!(Price::from_note("~price 1/0 divine"), None);
        assert_eq!(Price::from_note("selling cheap"), None);
        assert_eq!(Price::from_note("~b/o"), None);
    }

    #[test]
    fn test_tagged_keeps_identity() {
        let listing = Listing::new("abc", "Standard", "Tabula Rasa");
        let removed = listing.tagged(ListingState::Removed);
        assert_eq!(removed.id, listing.id);
        assert_eq!(removed.state, ListingState::Removed);
        assert_eq!(listing.state, ListingState::Unknown);
    }
}
