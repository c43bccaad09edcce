//! State key derivation.
//!
//! Every persistent record lives under `sha256(ADDRESS ":" suffix)`. The
//! suffixes are stable strings; changing one is a state migration. Partition
//! roots use the raw prefix bytes so their bucket keys stay under the same
//! namespace.

use sha2::{Digest, Sha256};

use smp_types::{AllocationId, ClientId, ProviderId, ProviderType};

/// The contract's own address on the host chain.
pub const ADDRESS: &str = "6dba10422e368813802877a85039d3985d96760ed844092319743fb3a76712d9";

fn derive(suffix: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(ADDRESS.as_bytes());
    hasher.update(b":");
    hasher.update(suffix.as_bytes());
    hasher.finalize().to_vec()
}

pub fn config_key() -> Vec<u8> {
    derive("config")
}

pub fn blobber_key(id: &str) -> Vec<u8> {
    derive(&format!("blobber:{id}"))
}

pub fn validator_key(id: &str) -> Vec<u8> {
    derive(&format!("validator:{id}"))
}

/// The index of all registered blobber ids, sorted.
pub fn blobber_index_key() -> Vec<u8> {
    derive("blobber_index")
}

pub fn validator_index_key() -> Vec<u8> {
    derive("validator_index")
}

pub fn stake_pool_key(provider_type: ProviderType, id: &ProviderId) -> Vec<u8> {
    derive(&format!("stake_pool:{}:{id}", provider_type.as_str()))
}

pub fn allocation_key(id: &AllocationId) -> Vec<u8> {
    derive(&format!("allocation:{id}"))
}

pub fn client_allocations_key(client_id: &ClientId) -> Vec<u8> {
    derive(&format!("client_allocations:{client_id}"))
}

pub fn challenge_pool_key(allocation_id: &AllocationId) -> Vec<u8> {
    derive(&format!("challenge_pool:{allocation_id}"))
}

pub fn allocation_challenges_key(allocation_id: &AllocationId) -> Vec<u8> {
    derive(&format!("allocation_challenges:{allocation_id}"))
}

pub fn challenge_key(challenge_id: &str) -> Vec<u8> {
    derive(&format!("challenge:{challenge_id}"))
}

pub fn read_pool_key(client_id: &ClientId) -> Vec<u8> {
    derive(&format!("read_pool:{client_id}"))
}

/// Cumulative read-marker counter per (allocation, blobber, reader).
pub fn read_counter_key(
    allocation_id: &AllocationId,
    blobber_id: &ProviderId,
    client_id: &ClientId,
) -> Vec<u8> {
    derive(&format!(
        "read_counter:{allocation_id}:{blobber_id}:{client_id}"
    ))
}

pub fn free_storage_assigner_key(client_id: &ClientId) -> Vec<u8> {
    derive(&format!("free_storage_assigner:{client_id}"))
}

/// Aggregate counters driving challenge generation.
pub fn storage_stats_key() -> Vec<u8> {
    derive("storage_stats")
}

/// Root prefix of the challenge-ready blobbers partition.
pub fn challenge_ready_parts_name() -> Vec<u8> {
    derive("parts:challenge_ready")
}

/// Root prefix of the registered-validators partition.
pub fn validator_parts_name() -> Vec<u8> {
    derive("parts:validators")
}

/// Root prefix of one blobber's served-allocations partition.
pub fn blobber_allocations_parts_name(blobber_id: &ProviderId) -> Vec<u8> {
    derive(&format!("parts:blobber_allocations:{blobber_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_and_distinct() {
        assert_eq!(config_key(), config_key());
        assert_ne!(blobber_key("a"), blobber_key("b"));
        assert_ne!(blobber_key("x"), validator_key("x"));
        assert_ne!(
            stake_pool_key(ProviderType::Blobber, &"x".to_string()),
            stake_pool_key(ProviderType::Validator, &"x".to_string()),
        );
        assert_eq!(config_key().len(), 32);
    }
}
