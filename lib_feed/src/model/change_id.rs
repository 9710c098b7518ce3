//! # Change Id (feed cursor)
//!
//! The upstream hands out opaque resumption tokens. In practice they are a
//! dash-separated list of per-shard counters (`2949-5013-4713-5521-1861`), which
//! lets us detect a regressing cursor. Tokens that do not have that shape are
//! treated as opaque and never considered a regression.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(String);

impl ChangeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Per-shard counters, when the token has the dash-separated numeric shape.
    pub fn segments(&self) -> Option<Vec<u64>> {
        if self.is_empty() {
            return None;
        }
        self.0.split('-').map(|s| s.trim().parse::<u64>().ok()).collect()
    }

    /// Compares two cursors shard by shard.
    ///
    /// `None` when the tokens are opaque, have a different shard count, or some
    /// shards moved forward while others moved back.
    pub fn compare(&self, other: &ChangeId) -> Option<Ordering> {
        if self.0 == other.0 {
            return Some(Ordering::Equal);
        }
        let (mine, theirs) = (self.segments()?, other.segments()?);
        if mine.len() != theirs.len() {
            return None;
        }
        let mut result = Ordering::Equal;
        for (a, b) in mine.iter().zip(theirs.iter()) {
            match (result, a.cmp(b)) {
                (_, Ordering::Equal) => {}
                (Ordering::Equal, ord) => result = ord,
                (current, ord) if current == ord => {}
                _ => return None,
            }
        }
        Some(result)
    }

    /// True when adopting `self` after `previous` would move the cursor backwards
    /// on any shard.
    pub fn regresses_from(&self, previous: &ChangeId) -> bool {
        match (self.segments(), previous.segments()) {
            (Some(next), Some(prev)) if next.len() == prev.len() => {
                next.iter().zip(prev.iter()).any(|(n, p)| n < p)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChangeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChangeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_ordering() {
        let a = ChangeId::from("10-20-30");
        let b = ChangeId::from("10-25-30");
        assert_eq!(b.compare(&a), Some(Ordering::Greater));
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(a.compare(&a.clone()), Some(Ordering::Equal));
        assert!(a.regresses_from(&b));
        assert!(!b.regresses_from(&a));
    }

    #[test]
    fn test_mixed_movement_is_incomparable_but_regressing() {
        let a = ChangeId::from("10-20");
        let b = ChangeId::from("11-19");
        assert_eq!(b.compare(&a), None);
        assert!(b.regresses_from(&a));
    }

    #[test]
    fn test_opaque_tokens_never_regress() {
        let a = ChangeId::from("abc");
        let b = ChangeId::from("abb");
        assert_eq!(b.compare(&a), None);
        assert!(!b.regresses_from(&a));
        assert!(ChangeId::from("  ").is_empty());
    }
}
