//! Events, transfers and mints buffered during a transaction.
//!
//! Events are advisory outputs for downstream indexers and are never read
//! back by the contract. Transfers and mints are instructions to the host
//! chain's balance layer, applied only when the transaction commits.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use smp_types::{AllocationId, ClientId, Coin, ProviderId};

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    AllocationCreated { allocation_id: AllocationId },
    AllocationUpdated { allocation_id: AllocationId },
    AllocationCanceled { allocation_id: AllocationId },
    AllocationFinalized { allocation_id: AllocationId },
    BlobberAdded { blobber_id: ProviderId },
    BlobberUpdated { blobber_id: ProviderId },
    BlobberShutDown { blobber_id: ProviderId },
    BlobberKilled { blobber_id: ProviderId },
    ValidatorAdded { validator_id: ProviderId },
    ValidatorUpdated { validator_id: ProviderId },
    ValidatorShutDown { validator_id: ProviderId },
    ValidatorKilled { validator_id: ProviderId },
    StakePoolUpdated { provider_id: ProviderId },
    ChallengeCreated { challenge_id: String, blobber_id: ProviderId },
    ChallengeResponded { challenge_id: String, passed: bool },
    WriteMarker { allocation_id: AllocationId, blobber_id: ProviderId, size: i64 },
    ReadMarker { allocation_id: AllocationId, blobber_id: ProviderId, read_counter: u64 },
    Reward { provider_id: ProviderId, amount: Coin },
    ConfigUpdated,
}

/// A balance movement between two accounts, executed by the host on commit.
#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub from: ClientId,
    pub to: ClientId,
    pub amount: Coin,
}

/// Newly created tokens, bounded by the configured mint cap.
#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct Mint {
    pub to: ClientId,
    pub amount: Coin,
}
