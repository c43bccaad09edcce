//! Write markers: `commit_connection`.
//!
//! A blobber redeems a client-signed write marker to account bytes it
//! accepted (or deleted, with a negative size). The marker chains
//! allocation roots linearly per blobber, and moves tokens between the
//! write pool and the challenge pool at the blobber's write price. The
//! move is computed from `|size|` the same way in both directions, so a
//! write of `+N` followed by `-N` restores both pools exactly.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use smp_types::{size_in_gb, AllocationId, ClientId, Coin, ProviderId, ProviderType, Timestamp};

use crate::allocation;
use crate::blobber;
use crate::challenge::{self, StorageStats};
use crate::challenge_pool;
use crate::context::Context;
use crate::crypto;
use crate::error::Error;
use crate::events::Event;
use crate::stake_pool;

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct WriteMarker {
    pub client_id: ClientId,
    pub client_public_key: String,
    pub blobber_id: ProviderId,
    pub allocation_id: AllocationId,
    pub owner_id: ClientId,
    pub timestamp: Timestamp,
    /// Signed byte delta; negative on delete.
    pub size: i64,
    pub allocation_root: String,
    pub prev_allocation_root: String,
    /// Hex ECDSA signature by the allocation owner over
    /// [`WriteMarker::signing_payload`].
    pub signature: String,
}

impl WriteMarker {
    /// SCALE encoding of every field but the signature.
    pub fn signing_payload(&self) -> Vec<u8> {
        (
            &self.client_id,
            &self.client_public_key,
            &self.blobber_id,
            &self.allocation_id,
            &self.owner_id,
            self.timestamp,
            self.size,
            &self.allocation_root,
            &self.prev_allocation_root,
        )
            .encode()
    }
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct CommitConnection {
    pub allocation_root: String,
    pub prev_allocation_root: String,
    pub write_marker: WriteMarker,
}

/// `commit_connection` — the blobber named by the marker redeems it.
pub fn do_commit_connection(ctx: &mut Context, input: CommitConnection) -> Result<(), Error> {
    let marker = input.write_marker;
    if ctx.txn.client_id != marker.blobber_id {
        return Err(Error::Auth(
            "write markers are redeemed by their blobber".into(),
        ));
    }
    if marker.allocation_root != input.allocation_root
        || marker.prev_allocation_root != input.prev_allocation_root
    {
        return Err(Error::InvalidInput(
            "connection roots do not match the marker".into(),
        ));
    }

    let mut alloc = allocation::get_active(ctx, &marker.allocation_id)?;
    if alloc.blobber_alloc(&marker.blobber_id).is_none() {
        return Err(Error::NotFound(format!(
            "blobber {} in allocation {}",
            marker.blobber_id, marker.allocation_id
        )));
    }
    crypto::verify_signature(
        &alloc.owner_public_key,
        &marker.signing_payload(),
        &marker.signature,
    )?;

    let ba = alloc
        .blobber_alloc(&marker.blobber_id)
        .cloned()
        .ok_or_else(|| Error::Internal("blobber allocation vanished".into()))?;
    if marker.prev_allocation_root != ba.allocation_root {
        return Err(Error::InvalidStateTransition(format!(
            "marker does not chain: prev root {:?} vs current {:?}",
            marker.prev_allocation_root, ba.allocation_root
        )));
    }

    let new_used = ba
        .stats
        .used_size
        .checked_add_signed(marker.size)
        .ok_or_else(|| Error::ConstraintViolation("used size below zero".into()))?;
    if new_used > ba.size {
        return Err(Error::ConstraintViolation(format!(
            "used size {new_used} exceeds blobber share {}",
            ba.size
        )));
    }

    // Token move at the blobber's write price, truncated once.
    let moved = Coin::from_float_floor(
        size_in_gb(marker.size.unsigned_abs()) * ba.terms.write_price.as_f64(),
    )
    .ok_or_else(|| Error::overflow("write marker move"))?;

    let mut pool = challenge_pool::get(ctx, &alloc.id)?;
    if marker.size >= 0 {
        if alloc.write_pool < moved {
            return Err(Error::ConstraintViolation(format!(
                "insufficient funds in write pool: need {moved}, have {}",
                alloc.write_pool
            )));
        }
        alloc.write_pool = alloc.write_pool.saturating_sub(moved);
        pool.balance = pool
            .balance
            .checked_add(moved)
            .ok_or_else(|| Error::overflow("challenge pool balance"))?;
    } else {
        if pool.balance < moved {
            return Err(Error::ConstraintViolation(format!(
                "insufficient funds in challenge pool: need {moved}, have {}",
                pool.balance
            )));
        }
        pool.balance = pool.balance.saturating_sub(moved);
        alloc.write_pool = alloc
            .write_pool
            .checked_add(moved)
            .ok_or_else(|| Error::overflow("write pool balance"))?;
    }
    challenge_pool::save(ctx, &alloc.id, &pool)?;

    {
        let ba = alloc
            .blobber_alloc_mut(&marker.blobber_id)
            .ok_or_else(|| Error::Internal("blobber allocation vanished".into()))?;
        ba.stats.used_size = new_used;
        if marker.size >= 0 {
            ba.challenge_pool_integral_value =
                ba.challenge_pool_integral_value.saturating_add(moved);
        } else {
            ba.challenge_pool_integral_value =
                ba.challenge_pool_integral_value.saturating_sub(moved);
        }
        ba.prev_allocation_root = ba.allocation_root.clone();
        ba.allocation_root = marker.allocation_root.clone();
    }
    alloc.stats.used_size = alloc
        .stats
        .used_size
        .checked_add_signed(marker.size)
        .ok_or_else(|| Error::ConstraintViolation("allocation used size below zero".into()))?;
    allocation::save(ctx, &alloc)?;

    let mut node = blobber::get(ctx, &marker.blobber_id)?;
    node.saved_data = node
        .saved_data
        .checked_add_signed(marker.size)
        .ok_or_else(|| Error::ConstraintViolation("saved data below zero".into()))?;
    blobber::save(ctx, &node)?;

    let mut stats: StorageStats = challenge::storage_stats(ctx)?;
    stats.total_saved_data = stats
        .total_saved_data
        .checked_add_signed(marker.size)
        .unwrap_or(0);
    challenge::save_storage_stats(ctx, &stats)?;

    let stake = stake_pool::get(ctx, ProviderType::Blobber, &marker.blobber_id)?.stake();
    blobber::refresh_challenge_ready(ctx, &marker.blobber_id, stake)?;

    ctx.emit(Event::WriteMarker {
        allocation_id: marker.allocation_id.clone(),
        blobber_id: marker.blobber_id.clone(),
        size: marker.size,
    });
    log::debug!(
        target: "write_marker",
        "blobber {} committed {} bytes on {}, moved {moved}",
        marker.blobber_id,
        marker.size,
        marker.allocation_id
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_payload_excludes_the_signature() {
        let mut marker = WriteMarker {
            client_id: "c".into(),
            client_public_key: "pk".into(),
            blobber_id: "b".into(),
            allocation_id: "a".into(),
            owner_id: "c".into(),
            timestamp: 7,
            size: 1024,
            allocation_root: "root1".into(),
            prev_allocation_root: String::new(),
            signature: "sig-a".into(),
        };
        let payload = marker.signing_payload();
        marker.signature = "sig-b".into();
        assert_eq!(payload, marker.signing_payload());
        marker.size = 2048;
        assert_ne!(payload, marker.signing_payload());
    }
}
