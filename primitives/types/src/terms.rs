//! Pricing terms quoted by blobbers and the ranges clients accept.

use codec::{Decode, Encode, MaxEncodedLen};
use scale_info::TypeInfo;
use serde::{Deserialize, Serialize};

use crate::Coin;

/// An inclusive `[min, max]` price interval, valid iff `min <= max`.
#[derive(
    Encode,
    Decode,
    MaxEncodedLen,
    TypeInfo,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
pub struct PriceRange {
    pub min: Coin,
    pub max: Coin,
}

impl PriceRange {
    pub fn new(min: Coin, max: Coin) -> Self {
        PriceRange { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }

    pub fn contains(&self, price: Coin) -> bool {
        self.min <= price && price <= self.max
    }
}

/// Prices quoted by a blobber, in coins per GB per time unit.
#[derive(
    Encode,
    Decode,
    MaxEncodedLen,
    TypeInfo,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
)]
pub struct Terms {
    /// Price for reading, per GB.
    pub read_price: Coin,
    /// Price for writing, per GB per time unit. Also drives the minimum
    /// lock demand and the pro-rata splits of the challenge pool.
    pub write_price: Coin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_range_validity() {
        assert!(PriceRange::new(Coin::new(1), Coin::new(2)).is_valid());
        assert!(PriceRange::new(Coin::new(2), Coin::new(2)).is_valid());
        assert!(!PriceRange::new(Coin::new(3), Coin::new(2)).is_valid());
    }

    #[test]
    fn price_range_contains_is_inclusive() {
        let range = PriceRange::new(Coin::new(10), Coin::new(20));
        assert!(range.contains(Coin::new(10)));
        assert!(range.contains(Coin::new(20)));
        assert!(!range.contains(Coin::new(9)));
        assert!(!range.contains(Coin::new(21)));
    }
}
