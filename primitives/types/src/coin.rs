//! Fixed-point token amounts.
//!
//! A [`Coin`] is the smallest indivisible token unit. All arithmetic is
//! checked; an operation that would underflow or overflow returns `None`
//! and the caller maps that into an `arith` error. Fractions of payouts
//! are computed through [`sp_arithmetic::Perbill`] or an `f64` ratio with
//! a single truncating conversion back to `Coin` at the payout site.

use codec::{Decode, Encode, MaxEncodedLen};
use scale_info::TypeInfo;
use serde::{Deserialize, Serialize};
use sp_arithmetic::Perbill;

/// Coins per whole token.
pub const COINS_PER_TOKEN: u64 = 10_000_000_000;

/// A non-negative token amount in the smallest unit.
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
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Coin(u64);

impl Coin {
    pub const ZERO: Coin = Coin(0);

    pub const fn new(value: u64) -> Self {
        Coin(value)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Coin) -> Option<Coin> {
        self.0.checked_add(rhs.0).map(Coin)
    }

    pub fn checked_sub(self, rhs: Coin) -> Option<Coin> {
        self.0.checked_sub(rhs.0).map(Coin)
    }

    pub fn checked_mul(self, rhs: u64) -> Option<Coin> {
        self.0.checked_mul(rhs).map(Coin)
    }

    pub fn saturating_sub(self, rhs: Coin) -> Coin {
        Coin(self.0.saturating_sub(rhs.0))
    }

    pub fn saturating_add(self, rhs: Coin) -> Coin {
        Coin(self.0.saturating_add(rhs.0))
    }

    pub fn min(self, rhs: Coin) -> Coin {
        Coin(self.0.min(rhs.0))
    }

    /// Truncating multiplication by a `[0, 1]` fraction.
    ///
    /// Rounding rule: floor, consistently at every payout site.
    pub fn portion(self, fraction: Perbill) -> Coin {
        Coin(fraction.mul_floor(self.0))
    }

    /// `self * numerator / denominator` in 128-bit intermediate precision,
    /// truncated. Returns `None` when the denominator is zero or the result
    /// does not fit a `u64`.
    pub fn mul_div(self, numerator: u64, denominator: u64) -> Option<Coin> {
        if denominator == 0 {
            return None;
        }
        let wide = (self.0 as u128).checked_mul(numerator as u128)? / denominator as u128;
        u64::try_from(wide).ok().map(Coin)
    }

    /// Truncating conversion from the float boundary of fee math.
    /// Negative, non-finite, and out-of-range values are rejected.
    pub fn from_float_floor(value: f64) -> Option<Coin> {
        if !value.is_finite() || value < 0.0 || value >= u64::MAX as f64 {
            return None;
        }
        Some(Coin(value as u64))
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64
    }

    /// Whole tokens, truncated. Used for stake weighting only.
    pub fn tokens(&self) -> u64 {
        self.0 / COINS_PER_TOKEN
    }

    /// Checked sum of an iterator of amounts.
    pub fn total<I: IntoIterator<Item = Coin>>(amounts: I) -> Option<Coin> {
        amounts
            .into_iter()
            .try_fold(Coin::ZERO, |acc, c| acc.checked_add(c))
    }
}

impl core::fmt::Display for Coin {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Coin {
    fn from(value: u64) -> Self {
        Coin(value)
    }
}
