//! Common types shared by every crate of the storage market contract.
//!
//! All monetary quantities are [`Coin`] values: non-negative integers in the
//! smallest token unit, with checked arithmetic only. Timestamps are seconds,
//! block rounds are monotone counters, and all identifiers are lowercase hex
//! strings assigned by the host chain.

pub mod coin;
pub mod terms;

pub use coin::Coin;
pub use terms::{PriceRange, Terms};

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use serde::{Deserialize, Serialize};

/// A client (wallet) identifier.
pub type ClientId = String;

/// A provider (blobber or validator) identifier.
pub type ProviderId = String;

/// An allocation identifier. Equals the hash of the transaction that
/// created the allocation.
pub type AllocationId = String;

/// A transaction hash, as assigned by the host chain.
pub type TxHash = String;

/// A point in time, in seconds.
pub type Timestamp = u64;

/// A block round number.
pub type Round = u64;

/// One gibibyte, the denominator of all price terms.
pub const GB: u64 = 1 << 30;

/// One mebibyte, the denominator of the challenge generation rate.
pub const MB: u64 = 1 << 20;

/// The kind of a registered provider.
///
/// Blobbers store data and answer challenges; validators attest to
/// challenge outcomes. Both carry a stake pool, keyed by this tag to
/// avoid id collisions between the two registries.
#[derive(
    Encode, Decode, TypeInfo, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ProviderType {
    Blobber,
    Validator,
}

impl ProviderType {
    /// Stable tag used in state key derivation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Blobber => "blobber",
            ProviderType::Validator => "validator",
        }
    }
}

/// Size in GB as a float, used only at the boundary of reward and fee math.
/// All comparisons with monetary totals stay in integers.
pub fn size_in_gb(size: u64) -> f64 {
    size as f64 / GB as f64
}

/// Each blobber of an allocation holds `ceil(size / shards)` bytes.
pub fn size_per_blobber(size: u64, shards: u64) -> u64 {
    debug_assert!(shards > 0);
    size.div_ceil(shards)
}
