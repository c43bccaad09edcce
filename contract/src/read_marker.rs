//! Read markers: `read_redeem`.
//!
//! Reads are metered in 64 KiB blocks. The marker carries a cumulative
//! per-(reader, blobber, allocation) counter signed by the reader; the
//! blobber redeems the delta since the last stored counter. Payment moves
//! from the reader's read pool into the blobber's stake pool rewards.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use smp_types::{size_in_gb, AllocationId, ClientId, Coin, ProviderId, ProviderType, Timestamp};

use crate::allocation;
use crate::context::Context;
use crate::crypto;
use crate::error::Error;
use crate::events::Event;
use crate::keys;
use crate::read_pool;
use crate::stake_pool;

/// Bytes per metered read block.
pub const READ_BLOCK_SIZE: u64 = 64 * 1024;

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct ReadMarker {
    pub client_id: ClientId,
    pub client_public_key: String,
    pub blobber_id: ProviderId,
    pub allocation_id: AllocationId,
    pub owner_id: ClientId,
    pub timestamp: Timestamp,
    /// Cumulative 64 KiB blocks read; strictly increasing per marker chain.
    pub read_counter: u64,
    /// Hex ECDSA signature by the reader over
    /// [`ReadMarker::signing_payload`].
    pub signature: String,
}

impl ReadMarker {
    pub fn signing_payload(&self) -> Vec<u8> {
        (
            &self.client_id,
            &self.client_public_key,
            &self.blobber_id,
            &self.allocation_id,
            &self.owner_id,
            self.timestamp,
            self.read_counter,
        )
            .encode()
    }
}

/// `read_redeem` — the blobber named by the marker redeems it.
pub fn do_read_redeem(ctx: &mut Context, marker: ReadMarker) -> Result<Coin, Error> {
    if ctx.txn.client_id != marker.blobber_id {
        return Err(Error::Auth(
            "read markers are redeemed by their blobber".into(),
        ));
    }
    let alloc = allocation::get_active(ctx, &marker.allocation_id)?;
    let ba = alloc
        .blobber_alloc(&marker.blobber_id)
        .ok_or_else(|| {
            Error::NotFound(format!(
                "blobber {} in allocation {}",
                marker.blobber_id, marker.allocation_id
            ))
        })?
        .clone();
    if marker.owner_id != alloc.owner {
        return Err(Error::InvalidInput("marker names the wrong owner".into()));
    }
    crypto::verify_signature(
        &marker.client_public_key,
        &marker.signing_payload(),
        &marker.signature,
    )?;

    let counter_key =
        keys::read_counter_key(&marker.allocation_id, &marker.blobber_id, &marker.client_id);
    let previous: u64 = ctx.get(&counter_key)?.unwrap_or(0);
    if marker.read_counter <= previous {
        return Err(Error::InvalidStateTransition(format!(
            "read counter {} is not past {previous}",
            marker.read_counter
        )));
    }
    let delta_blocks = marker.read_counter - previous;

    let payment = Coin::from_float_floor(
        size_in_gb(
            delta_blocks
                .checked_mul(READ_BLOCK_SIZE)
                .ok_or_else(|| Error::overflow("read volume"))?,
        ) * ba.terms.read_price.as_f64(),
    )
    .ok_or_else(|| Error::overflow("read payment"))?;

    let mut pool = read_pool::get(ctx, &marker.client_id)?;
    if pool.balance < payment {
        return Err(Error::ConstraintViolation(format!(
            "insufficient funds in read pool: need {payment}, have {}",
            pool.balance
        )));
    }
    pool.balance = pool.balance.saturating_sub(payment);
    read_pool::save(ctx, &marker.client_id, &pool)?;

    let mut sp = stake_pool::get(ctx, ProviderType::Blobber, &marker.blobber_id)?;
    sp.distribute_reward(payment)?;
    stake_pool::save(ctx, ProviderType::Blobber, &marker.blobber_id, &sp)?;

    ctx.put(&counter_key, &marker.read_counter)?;
    ctx.emit(Event::ReadMarker {
        allocation_id: marker.allocation_id.clone(),
        blobber_id: marker.blobber_id.clone(),
        read_counter: marker.read_counter,
    });
    ctx.emit(Event::Reward {
        provider_id: marker.blobber_id.clone(),
        amount: payment,
    });
    log::debug!(
        target: "read_marker",
        "blobber {} redeemed {delta_blocks} blocks for {payment}",
        marker.blobber_id
    );
    Ok(payment)
}
