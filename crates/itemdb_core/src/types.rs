//! Identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;

/// Identifier of an item.
///
/// Zero and negative raw values mean "no item" and never produce an
/// `ItemId`. Ids are never reused within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(NonZeroU64);

impl ItemId {
    /// Wraps a raw id. Returns `None` for zero.
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Wraps a signed raw id. Returns `None` for zero and negative values.
    #[must_use]
    pub const fn from_signed(raw: i64) -> Option<Self> {
        if raw <= 0 {
            None
        } else {
            Self::new(raw as u64)
        }
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item:{}", self.0)
    }
}

/// Item change number: the store's logical clock.
///
/// Each successful write transaction gets the next ICN. ICN 0 is the
/// genesis state holding only the system schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Icn(pub u64);

impl Icn {
    /// The genesis change number.
    pub const ZERO: Self = Self(0);

    /// Creates a change number.
    #[must_use]
    pub const fn new(icn: u64) -> Self {
        Self(icn)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next change number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Icn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "icn:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_negative_are_not_items() {
        assert!(ItemId::new(0).is_none());
        assert!(ItemId::from_signed(-3).is_none());
        assert!(ItemId::from_signed(0).is_none());
        assert_eq!(ItemId::from_signed(7).map(ItemId::get), Some(7));
    }

    #[test]
    fn icn_next_and_display() {
        let icn = Icn::new(5);
        assert_eq!(icn.next().as_u64(), 6);
        assert_eq!(format!("{icn}"), "icn:5");
        assert!(Icn::ZERO < icn);
    }

    #[test]
    fn item_display() {
        assert_eq!(ItemId::new(42).unwrap().to_string(), "item:42");
    }
}
