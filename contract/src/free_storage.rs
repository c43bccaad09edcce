//! Free storage grants: `add_free_storage_assigner`,
//! `free_allocation_request`, `free_update_allocation`.
//!
//! The contract owner registers assigners, each with a per-grant and a
//! lifetime token limit. An assigner hands out signed markers off-chain;
//! the recipient redeems a marker to mint tokens into a fresh allocation
//! shaped by the configured free-allocation settings, or to top up and
//! extend one it already has.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use smp_types::{AllocationId, ClientId, Coin, ProviderId, ProviderType, Timestamp};

use crate::allocation::{self, FundingSource, NewAllocationRequest};
use crate::blobber;
use crate::context::Context;
use crate::crypto;
use crate::error::Error;
use crate::keys;
use crate::provider::{is_healthy, ProviderStatus};
use crate::stake_pool;

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct FreeStorageAssigner {
    pub client_id: ClientId,
    pub public_key: String,
    /// Largest single grant, in coins.
    pub individual_limit: Coin,
    /// Lifetime cap across all grants, in coins.
    pub total_limit: Coin,
    pub current_redeemed: Coin,
}

pub fn get_assigner(ctx: &Context, client_id: &ClientId) -> Result<FreeStorageAssigner, Error> {
    ctx.require(
        &keys::free_storage_assigner_key(client_id),
        &format!("free storage assigner {client_id}"),
    )
}

fn save_assigner(ctx: &mut Context, assigner: &FreeStorageAssigner) -> Result<(), Error> {
    ctx.put(&keys::free_storage_assigner_key(&assigner.client_id), assigner)
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct AddFreeStorageAssignerRequest {
    pub client_id: ClientId,
    pub public_key: String,
    pub individual_limit: Coin,
    pub total_limit: Coin,
}

/// `add_free_storage_assigner` — contract owner only. Re-registering an
/// assigner updates its limits but keeps the redeemed total.
pub fn do_add_free_storage_assigner(
    ctx: &mut Context,
    request: AddFreeStorageAssignerRequest,
) -> Result<(), Error> {
    let config = ctx.config()?;
    if ctx.txn.client_id != config.owner_id {
        return Err(Error::Auth(
            "only the contract owner can add free storage assigners".into(),
        ));
    }
    if request.client_id.is_empty() || request.public_key.is_empty() {
        return Err(Error::InvalidInput(
            "assigner id and public key are required".into(),
        ));
    }
    if request.individual_limit > request.total_limit {
        return Err(Error::ConstraintViolation(
            "individual limit exceeds total limit".into(),
        ));
    }
    let current_redeemed = ctx
        .get::<FreeStorageAssigner>(&keys::free_storage_assigner_key(&request.client_id))?
        .map(|existing| existing.current_redeemed)
        .unwrap_or(Coin::ZERO);
    save_assigner(
        ctx,
        &FreeStorageAssigner {
            client_id: request.client_id,
            public_key: request.public_key,
            individual_limit: request.individual_limit,
            total_limit: request.total_limit,
            current_redeemed,
        },
    )
}

/// Off-chain grant, signed by the assigner.
#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct FreeStorageMarker {
    pub assigner: ClientId,
    pub recipient: ClientId,
    pub free_tokens: Coin,
    pub timestamp: Timestamp,
    /// Hex ECDSA signature by the assigner over
    /// [`FreeStorageMarker::signing_payload`].
    pub signature: String,
}

impl FreeStorageMarker {
    pub fn signing_payload(&self) -> Vec<u8> {
        (
            &self.assigner,
            &self.recipient,
            self.free_tokens,
            self.timestamp,
        )
            .encode()
    }
}

/// Verifies the marker and books the tokens against the assigner's limits.
fn redeem_marker(ctx: &mut Context, marker: &FreeStorageMarker) -> Result<(), Error> {
    if ctx.txn.client_id != marker.recipient {
        return Err(Error::Auth(
            "free storage markers are redeemed by their recipient".into(),
        ));
    }
    let mut assigner = get_assigner(ctx, &marker.assigner)?;
    crypto::verify_signature(
        &assigner.public_key,
        &marker.signing_payload(),
        &marker.signature,
    )?;
    if marker.free_tokens > assigner.individual_limit {
        return Err(Error::ConstraintViolation(format!(
            "grant of {} exceeds the individual limit {}",
            marker.free_tokens, assigner.individual_limit
        )));
    }
    let redeemed = assigner
        .current_redeemed
        .checked_add(marker.free_tokens)
        .ok_or_else(|| Error::overflow("redeemed total"))?;
    if redeemed > assigner.total_limit {
        return Err(Error::ConstraintViolation(format!(
            "grant of {} exceeds the assigner's remaining allowance {}",
            marker.free_tokens,
            assigner.total_limit.saturating_sub(assigner.current_redeemed)
        )));
    }
    assigner.current_redeemed = redeemed;
    save_assigner(ctx, &assigner)
}

/// Picks the first registered blobbers able to host a free allocation:
/// active, recently health-checked, terms inside the configured free price
/// ranges, spare capacity for their share, and free stake for the offer.
fn pick_free_blobbers(
    ctx: &Context,
    share: u64,
    bsize: u64,
    wanted: usize,
) -> Result<Vec<ProviderId>, Error> {
    let config = ctx.config()?;
    let settings = &config.free_allocation_settings;
    let mut picked = Vec::with_capacity(wanted);
    for id in blobber::index(ctx)? {
        let Some(node) = blobber::maybe_get(ctx, &id)? else {
            continue;
        };
        if node.status != ProviderStatus::Active
            || !is_healthy(node.last_health_check, ctx.now(), config.health_check_period)
            || !settings.read_price_range.contains(node.terms.read_price)
            || !settings.write_price_range.contains(node.terms.write_price)
            || node.capacity.saturating_sub(node.allocated) < share
        {
            continue;
        }
        let sp = stake_pool::get(ctx, ProviderType::Blobber, &id)?;
        if sp.free_stake() < allocation::price_of(bsize, node.terms.write_price)? {
            continue;
        }
        picked.push(id);
        if picked.len() == wanted {
            return Ok(picked);
        }
    }
    Err(Error::NotFound(format!(
        "only {} of {wanted} blobbers can host a free allocation",
        picked.len()
    )))
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct FreeStorageRequest {
    pub recipient_public_key: String,
    pub marker: FreeStorageMarker,
}

/// `free_allocation_request` — mints the granted tokens and opens an
/// allocation shaped by the configured free-allocation settings.
pub fn do_free_allocation_request(
    ctx: &mut Context,
    request: FreeStorageRequest,
) -> Result<AllocationId, Error> {
    redeem_marker(ctx, &request.marker)?;
    let config = ctx.config()?;
    let settings = config.free_allocation_settings.clone();

    let shards = (settings.data_shards + settings.parity_shards) as usize;
    let share = settings.size.div_ceil(shards as u64);
    let bsize = settings.size.div_ceil(settings.data_shards as u64);
    let blobbers = pick_free_blobbers(ctx, share, bsize, shards)?;

    ctx.mint(keys::ADDRESS, request.marker.free_tokens)?;
    let new_request = NewAllocationRequest {
        owner: request.marker.recipient.clone(),
        owner_public_key: request.recipient_public_key,
        size: settings.size,
        data_shards: settings.data_shards,
        parity_shards: settings.parity_shards,
        expiration: ctx.now() + settings.duration,
        read_price_range: settings.read_price_range,
        write_price_range: settings.write_price_range,
        blobbers,
        third_party_extendable: false,
    };
    allocation::create_allocation(
        ctx,
        new_request,
        request.marker.free_tokens,
        FundingSource::Minted,
    )
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct FreeUpdateAllocationRequest {
    pub allocation_id: AllocationId,
    pub marker: FreeStorageMarker,
}

/// `free_update_allocation` — mints the granted tokens into the write pool
/// of an existing allocation and extends it by one more free lease.
pub fn do_free_update_allocation(
    ctx: &mut Context,
    request: FreeUpdateAllocationRequest,
) -> Result<(), Error> {
    redeem_marker(ctx, &request.marker)?;
    let config = ctx.config()?;
    let duration = config.free_allocation_settings.duration;

    let mut alloc = allocation::get_active(ctx, &request.allocation_id)?;
    if alloc.owner != request.marker.recipient {
        return Err(Error::Auth(
            "grant recipient does not own the allocation".into(),
        ));
    }

    ctx.mint(keys::ADDRESS, request.marker.free_tokens)?;
    alloc.write_pool = alloc
        .write_pool
        .checked_add(request.marker.free_tokens)
        .ok_or_else(|| Error::overflow("write pool"))?;
    alloc.expiration = alloc
        .expiration
        .checked_add(duration)
        .ok_or_else(|| Error::overflow("expiration"))?;

    // Offers track the allocation's lifetime.
    for ba in &alloc.blobber_allocs {
        let mut sp = stake_pool::get(ctx, ProviderType::Blobber, &ba.blobber_id)?;
        if let Some(offer) = sp.release_offer(&alloc.id) {
            sp.add_offer(&alloc.id, offer.lock, alloc.expiration)?;
        }
        stake_pool::save(ctx, ProviderType::Blobber, &ba.blobber_id, &sp)?;
    }
    allocation::save(ctx, &alloc)
}
