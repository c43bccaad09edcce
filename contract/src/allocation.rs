//! Allocations: the hub record of the contract.
//!
//! An allocation stripes `size` bytes across `data_shards + parity_shards`
//! blobbers. It owns the write pool (the client's prepaid balance), a
//! challenge pool, and one offer against each blobber's stake pool.
//! Lifecycle: `Created → Active → {Canceled, Finalized}`; the terminal
//! states are absorbing and both run the same settlement.
//!
//! Sizing has two views. The physical share each blobber stores is
//! `ceil(size / shards)`, reconciled so the shares sum to `size` exactly.
//! The billing size is `ceil(size / data_shards)`: parity expands what a
//! blobber must hold relative to the data it serves, so costs, offers and
//! minimum lock demands all use the billing size.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use smp_partitions::{PartitionItem, Partitions};
use smp_types::{
    size_in_gb, AllocationId, ClientId, Coin, PriceRange, ProviderId, ProviderType, Terms,
    Timestamp,
};

use crate::blobber::{self, StorageNode, PARTITION_SIZE};
use crate::challenge;
use crate::challenge_pool;
use crate::config::Config;
use crate::context::Context;
use crate::error::Error;
use crate::events::Event;
use crate::keys;
use crate::stake_pool;

#[derive(Encode, Decode, TypeInfo, Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub used_size: u64,
    pub open_challenges: u64,
    pub total_challenges: u64,
    pub success_challenges: u64,
    pub failed_challenges: u64,
    pub latest_closed_challenge_txn: String,
}

/// One blobber's share of an allocation.
#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct BlobberAllocation {
    pub allocation_id: AllocationId,
    pub blobber_id: ProviderId,
    /// Physical bytes this blobber stores for the allocation.
    pub size: u64,
    /// Terms frozen at the time the blobber joined.
    pub terms: Terms,
    pub stats: AllocationStats,
    pub min_lock_demand: Coin,
    /// Rewards already paid to this blobber from the challenge pool.
    pub spent: Coin,
    /// Running share of the challenge pool owed to this blobber, fed by
    /// write markers and drained by challenge closes.
    pub challenge_pool_integral_value: Coin,
    pub latest_finalized_chall_created_at: Timestamp,
    pub latest_successful_chall_created_at: Timestamp,
    /// Write markers chain roots linearly per blobber.
    pub allocation_root: String,
    pub prev_allocation_root: String,
}

impl BlobberAllocation {
    /// `success / total`, defined as 1 when no challenge was ever issued.
    pub fn pass_rate(&self) -> f64 {
        if self.stats.total_challenges == 0 {
            1.0
        } else {
            self.stats.success_challenges as f64 / self.stats.total_challenges as f64
        }
    }
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct StorageAllocation {
    /// Equals the hash of the creating transaction.
    pub id: AllocationId,
    pub owner: ClientId,
    pub owner_public_key: String,
    pub data_shards: u32,
    pub parity_shards: u32,
    pub size: u64,
    pub expiration: Timestamp,
    pub read_price_range: PriceRange,
    pub write_price_range: PriceRange,
    pub blobber_allocs: Vec<BlobberAllocation>,
    /// The client's prepaid balance for this allocation.
    pub write_pool: Coin,
    pub min_lock_demand: Coin,
    pub stats: AllocationStats,
    pub third_party_extendable: bool,
    pub curators: Vec<ClientId>,
    pub start_time: Timestamp,
    pub finalized: bool,
    pub canceled: bool,
}

impl StorageAllocation {
    pub fn shards(&self) -> u32 {
        self.data_shards + self.parity_shards
    }

    /// Billing size per blobber.
    pub fn bsize(&self) -> u64 {
        self.size.div_ceil(self.data_shards as u64)
    }

    pub fn is_active(&self) -> bool {
        !self.finalized && !self.canceled
    }

    pub fn blobber_alloc(&self, blobber_id: &str) -> Option<&BlobberAllocation> {
        self.blobber_allocs
            .iter()
            .find(|ba| ba.blobber_id == blobber_id)
    }

    pub fn blobber_alloc_mut(&mut self, blobber_id: &str) -> Option<&mut BlobberAllocation> {
        self.blobber_allocs
            .iter_mut()
            .find(|ba| ba.blobber_id == blobber_id)
    }

    /// Physical shares, ceiling division reconciled so they sum to `size`.
    pub fn physical_shares(&self) -> Vec<u64> {
        let shards = self.shards() as u64;
        let per = self.size.div_ceil(shards);
        let mut remaining = self.size;
        (0..shards)
            .map(|_| {
                let share = per.min(remaining);
                remaining -= share;
                share
            })
            .collect()
    }
}

/// Membership record of a blobber's served-allocations partition.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct ServedAllocation {
    pub allocation_id: AllocationId,
}

impl PartitionItem for ServedAllocation {
    fn name(&self) -> &str {
        &self.allocation_id
    }
}

pub fn get(ctx: &Context, id: &AllocationId) -> Result<StorageAllocation, Error> {
    ctx.require(&keys::allocation_key(id), &format!("allocation {id}"))
}

pub fn save(ctx: &mut Context, allocation: &StorageAllocation) -> Result<(), Error> {
    ctx.put(&keys::allocation_key(&allocation.id), allocation)
}

/// The allocation must exist and be in `Active`.
pub fn get_active(ctx: &Context, id: &AllocationId) -> Result<StorageAllocation, Error> {
    let allocation = get(ctx, id)?;
    if !allocation.is_active() {
        return Err(Error::InvalidStateTransition(format!(
            "allocation {id} is {}",
            if allocation.finalized { "finalized" } else { "canceled" }
        )));
    }
    Ok(allocation)
}

/// `floor(size_in_gb(bsize) * write_price)` — the per-blobber cost and
/// offer lock. Truncation is the rounding rule at every payout site.
pub(crate) fn price_of(bsize: u64, write_price: Coin) -> Result<Coin, Error> {
    Coin::from_float_floor(size_in_gb(bsize) * write_price.as_f64())
        .ok_or_else(|| Error::overflow("blobber price"))
}

fn min_lock_demand_of(
    config: &Config,
    bsize: u64,
    write_price: Coin,
    now: Timestamp,
    expiration: Timestamp,
) -> Result<Coin, Error> {
    let ratio = config.min_lock_demand.deconstruct() as f64 / 1_000_000_000.0;
    let rdtu = config.duration_in_time_units(now, expiration);
    Coin::from_float_floor(size_in_gb(bsize) * write_price.as_f64() * ratio * rdtu)
        .ok_or_else(|| Error::overflow("min lock demand"))
}

// --- creation ---------------------------------------------------------

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct NewAllocationRequest {
    pub owner: ClientId,
    pub owner_public_key: String,
    pub size: u64,
    pub data_shards: u32,
    pub parity_shards: u32,
    pub expiration: Timestamp,
    pub read_price_range: PriceRange,
    pub write_price_range: PriceRange,
    pub blobbers: Vec<ProviderId>,
    pub third_party_extendable: bool,
}

/// `new_allocation_request` — all-or-nothing creation, funded by `tx.value`.
pub fn do_new_allocation_request(
    ctx: &mut Context,
    request: NewAllocationRequest,
) -> Result<AllocationId, Error> {
    let funding = ctx.txn.value;
    create_allocation(ctx, request, funding, FundingSource::Transaction)
}

/// Who pays for the allocation's write pool.
pub enum FundingSource {
    /// `tx.value`, transferred from the caller.
    Transaction,
    /// Already-minted free-storage tokens held by the contract.
    Minted,
}

pub fn create_allocation(
    ctx: &mut Context,
    request: NewAllocationRequest,
    funding: Coin,
    source: FundingSource,
) -> Result<AllocationId, Error> {
    let config = ctx.config()?;
    let now = ctx.now();
    let id = ctx.txn.hash.clone();

    // Idempotency on the transaction hash.
    if ctx.get::<StorageAllocation>(&keys::allocation_key(&id))?.is_some() {
        return Err(Error::AlreadyExists(format!("allocation {id}")));
    }

    if request.data_shards == 0 {
        return Err(Error::InvalidInput("data_shards must be at least 1".into()));
    }
    if request.owner.is_empty() || request.owner_public_key.is_empty() {
        return Err(Error::InvalidInput("owner and owner public key are required".into()));
    }
    if request.size < config.min_alloc_size {
        return Err(Error::ConstraintViolation(format!(
            "size {} is below min_alloc_size {}",
            request.size, config.min_alloc_size
        )));
    }
    if request.expiration <= now {
        return Err(Error::ConstraintViolation(
            "expiration must lie in the future".into(),
        ));
    }
    if !request.read_price_range.is_valid() || !request.write_price_range.is_valid() {
        return Err(Error::InvalidInput("price range is inverted".into()));
    }
    if request.read_price_range.max > config.max_read_price
        || request.write_price_range.min < config.min_write_price
        || request.write_price_range.max > config.max_write_price
    {
        return Err(Error::ConstraintViolation(
            "price range outside configured bounds".into(),
        ));
    }
    let shards = (request.data_shards + request.parity_shards) as usize;
    if request.blobbers.len() != shards {
        return Err(Error::InvalidInput(format!(
            "expected {shards} blobbers, got {}",
            request.blobbers.len()
        )));
    }
    if shards as u32 > config.max_blobbers_per_allocation {
        return Err(Error::ConstraintViolation(format!(
            "{shards} blobbers exceed max_blobbers_per_allocation {}",
            config.max_blobbers_per_allocation
        )));
    }
    {
        let mut seen = request.blobbers.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != shards {
            return Err(Error::InvalidInput("duplicate blobber in request".into()));
        }
    }

    // Resolve and vet every blobber before mutating anything.
    let size_per_blobber = request.size.div_ceil(shards as u64);
    let bsize = request.size.div_ceil(request.data_shards as u64);
    let mut nodes: Vec<StorageNode> = Vec::with_capacity(shards);
    for blobber_id in &request.blobbers {
        let node = blobber::get(ctx, blobber_id)?;
        if !node.is_active() {
            return Err(Error::InvalidStateTransition(format!(
                "blobber {blobber_id} is {}",
                node.status.as_str()
            )));
        }
        if !request.write_price_range.contains(node.terms.write_price)
            || !request.read_price_range.contains(node.terms.read_price)
        {
            return Err(Error::ConstraintViolation(format!(
                "blobber {blobber_id} terms outside requested ranges"
            )));
        }
        if node.allocated + size_per_blobber > node.capacity {
            return Err(Error::ConstraintViolation(format!(
                "blobber {blobber_id} lacks capacity"
            )));
        }
        nodes.push(node);
    }

    let mut cost = Coin::ZERO;
    for node in &nodes {
        cost = cost
            .checked_add(price_of(bsize, node.terms.write_price)?)
            .ok_or_else(|| Error::overflow("allocation cost"))?;
    }
    if funding < cost {
        return Err(Error::ConstraintViolation(format!(
            "insufficient funds: allocation costs {cost}, got {funding}"
        )));
    }

    let shares = {
        let shards = shards as u64;
        let per = request.size.div_ceil(shards);
        let mut remaining = request.size;
        (0..shards)
            .map(|_| {
                let share = per.min(remaining);
                remaining -= share;
                share
            })
            .collect::<Vec<u64>>()
    };

    let mut blobber_allocs = Vec::with_capacity(shards);
    let mut total_mld = Coin::ZERO;
    for (node, share) in nodes.iter_mut().zip(shares) {
        node.allocated += share;
        let mld = min_lock_demand_of(&config, bsize, node.terms.write_price, now, request.expiration)?;
        total_mld = total_mld
            .checked_add(mld)
            .ok_or_else(|| Error::overflow("min lock demand total"))?;
        blobber_allocs.push(BlobberAllocation {
            allocation_id: id.clone(),
            blobber_id: node.id.clone(),
            size: share,
            terms: node.terms,
            stats: AllocationStats::default(),
            min_lock_demand: mld,
            spent: Coin::ZERO,
            challenge_pool_integral_value: Coin::ZERO,
            latest_finalized_chall_created_at: now,
            latest_successful_chall_created_at: now,
            allocation_root: String::new(),
            prev_allocation_root: String::new(),
        });

        let mut pool = stake_pool::get(ctx, ProviderType::Blobber, &node.id)?;
        pool.add_offer(&id, price_of(bsize, node.terms.write_price)?, request.expiration)?;
        stake_pool::save(ctx, ProviderType::Blobber, &node.id, &pool)?;
        blobber::save(ctx, node)?;

        let name = keys::blobber_allocations_parts_name(&node.id);
        let mut parts = Partitions::<ServedAllocation>::open(ctx.store(), &name, PARTITION_SIZE)?;
        parts.add(
            ctx.store_mut(),
            &ServedAllocation {
                allocation_id: id.clone(),
            },
        )?;
        let stake = stake_pool::get(ctx, ProviderType::Blobber, &node.id)?.stake();
        blobber::refresh_challenge_ready(ctx, &node.id, stake)?;
    }

    challenge_pool::create(ctx, &id)?;
    if let FundingSource::Transaction = source {
        ctx.transfer(&ctx.txn.client_id.clone(), keys::ADDRESS, funding);
    }

    let allocation = StorageAllocation {
        id: id.clone(),
        owner: request.owner,
        owner_public_key: request.owner_public_key,
        data_shards: request.data_shards,
        parity_shards: request.parity_shards,
        size: request.size,
        expiration: request.expiration,
        read_price_range: request.read_price_range,
        write_price_range: request.write_price_range,
        blobber_allocs,
        write_pool: funding,
        min_lock_demand: total_mld,
        stats: AllocationStats::default(),
        third_party_extendable: request.third_party_extendable,
        curators: Vec::new(),
        start_time: now,
        finalized: false,
        canceled: false,
    };
    save(ctx, &allocation)?;

    let mut owned: Vec<AllocationId> = ctx
        .get(&keys::client_allocations_key(&allocation.owner))?
        .unwrap_or_default();
    owned.push(id.clone());
    ctx.put(&keys::client_allocations_key(&allocation.owner), &owned)?;

    ctx.emit(Event::AllocationCreated {
        allocation_id: id.clone(),
    });
    log::debug!(target: "allocation", "allocation {id} created, {shards} blobbers, {funding} locked");
    Ok(id)
}

// --- update -----------------------------------------------------------

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct UpdateAllocationRequest {
    pub id: AllocationId,
    /// Signed size delta in bytes.
    pub size: i64,
    /// Signed expiration delta in seconds.
    pub expiration: i64,
    pub add_blobber_id: Option<ProviderId>,
    pub remove_blobber_id: Option<ProviderId>,
}

/// `update_allocation_request` — resize/extend, or swap one blobber for
/// another. Only the owner, except that anyone may extend a
/// third-party-extendable allocation.
pub fn do_update_allocation_request(
    ctx: &mut Context,
    request: UpdateAllocationRequest,
) -> Result<(), Error> {
    let config = ctx.config()?;
    let now = ctx.now();
    let mut allocation = get_active(ctx, &request.id)?;
    if now >= allocation.expiration {
        return Err(Error::InvalidStateTransition(
            "allocation is expired, finalize it".into(),
        ));
    }

    let is_owner = ctx.txn.client_id == allocation.owner;
    let pure_extension = request.size >= 0
        && request.expiration >= 0
        && request.add_blobber_id.is_none()
        && request.remove_blobber_id.is_none();
    if !is_owner && !(allocation.third_party_extendable && pure_extension) {
        return Err(Error::Auth("only the owner can update the allocation".into()));
    }

    let old_bsize = allocation.bsize();
    let new_size = allocation
        .size
        .checked_add_signed(request.size)
        .ok_or_else(|| Error::overflow("allocation size"))?;
    if new_size < config.min_alloc_size {
        return Err(Error::ConstraintViolation(format!(
            "size {new_size} is below min_alloc_size {}",
            config.min_alloc_size
        )));
    }
    let new_expiration = allocation
        .expiration
        .checked_add_signed(request.expiration)
        .ok_or_else(|| Error::overflow("allocation expiration"))?;
    if new_expiration <= now {
        return Err(Error::ConstraintViolation(
            "expiration must lie in the future".into(),
        ));
    }

    if request.size < 0 {
        if allocation.stats.open_challenges > 0 {
            return Err(Error::InvalidStateTransition(
                "cannot shrink while challenges are open".into(),
            ));
        }
        if allocation.stats.used_size > new_size {
            return Err(Error::ConstraintViolation(format!(
                "used size {} does not fit into {new_size}",
                allocation.stats.used_size
            )));
        }
    }

    if request.add_blobber_id.is_some() || request.remove_blobber_id.is_some() {
        let added = request
            .add_blobber_id
            .clone()
            .ok_or_else(|| Error::InvalidInput("blobber removal requires a replacement".into()))?;
        let removed = request
            .remove_blobber_id
            .clone()
            .ok_or_else(|| Error::InvalidInput("blobber addition requires a removal".into()))?;
        replace_blobber(ctx, &mut allocation, &removed, &added)?;
    }

    // Incremental cost of growth, debited from tx.value.
    allocation.size = new_size;
    allocation.expiration = new_expiration;
    let new_bsize = allocation.bsize();

    let mut old_cost = Coin::ZERO;
    let mut new_cost = Coin::ZERO;
    for ba in &allocation.blobber_allocs {
        old_cost = old_cost
            .checked_add(price_of(old_bsize, ba.terms.write_price)?)
            .ok_or_else(|| Error::overflow("allocation cost"))?;
        new_cost = new_cost
            .checked_add(price_of(new_bsize, ba.terms.write_price)?)
            .ok_or_else(|| Error::overflow("allocation cost"))?;
    }
    let due = new_cost.saturating_sub(old_cost);
    let value = ctx.txn.value;
    if value < due {
        return Err(Error::ConstraintViolation(format!(
            "insufficient funds: extension costs {due}, got {value}"
        )));
    }

    // Re-shape every blobber's share, capacity-checked, and refresh offers.
    let shares = allocation.physical_shares();
    let allocation_id = allocation.id.clone();
    for (ba, share) in allocation.blobber_allocs.iter_mut().zip(shares) {
        let mut node = blobber::get(ctx, &ba.blobber_id)?;
        node.allocated = node
            .allocated
            .saturating_sub(ba.size)
            .checked_add(share)
            .ok_or_else(|| Error::overflow("blobber allocated"))?;
        if node.allocated > node.capacity {
            return Err(Error::ConstraintViolation(format!(
                "blobber {} lacks capacity",
                ba.blobber_id
            )));
        }
        ba.size = share;

        let mut pool = stake_pool::get(ctx, ProviderType::Blobber, &ba.blobber_id)?;
        pool.release_offer(&allocation_id);
        pool.add_offer(
            &allocation_id,
            price_of(new_bsize, ba.terms.write_price)?,
            new_expiration,
        )?;
        stake_pool::save(ctx, ProviderType::Blobber, &ba.blobber_id, &pool)?;
        blobber::save(ctx, &node)?;
    }

    if !value.is_zero() {
        allocation.write_pool = allocation
            .write_pool
            .checked_add(value)
            .ok_or_else(|| Error::overflow("write pool"))?;
        ctx.transfer(&ctx.txn.client_id.clone(), keys::ADDRESS, value);
    }

    save(ctx, &allocation)?;
    ctx.emit(Event::AllocationUpdated {
        allocation_id: allocation.id.clone(),
    });
    Ok(())
}

/// Swaps `removed` for `added`, moving the per-blobber record across. The
/// replacement is expected to resync the data off-chain; the record keeps
/// its size and integral value so the escrow stays consistent, while the
/// marker root chain restarts.
fn replace_blobber(
    ctx: &mut Context,
    allocation: &mut StorageAllocation,
    removed: &ProviderId,
    added: &ProviderId,
) -> Result<(), Error> {
    if allocation.blobber_alloc(added).is_some() {
        return Err(Error::AlreadyExists(format!(
            "blobber {added} already serves the allocation"
        )));
    }
    let position = allocation
        .blobber_allocs
        .iter()
        .position(|ba| ba.blobber_id == *removed)
        .ok_or_else(|| Error::NotFound(format!("blobber {removed} in allocation")))?;

    let node = blobber::get(ctx, added)?;
    if !node.is_active() {
        return Err(Error::InvalidStateTransition(format!(
            "blobber {added} is {}",
            node.status.as_str()
        )));
    }
    if !allocation.write_price_range.contains(node.terms.write_price)
        || !allocation.read_price_range.contains(node.terms.read_price)
    {
        return Err(Error::ConstraintViolation(format!(
            "blobber {added} terms outside allocation ranges"
        )));
    }
    let ba_size = allocation.blobber_allocs[position].size;
    let ba_used = allocation.blobber_allocs[position].stats.used_size;
    if node.allocated + ba_size > node.capacity {
        return Err(Error::ConstraintViolation(format!(
            "blobber {added} lacks capacity"
        )));
    }

    // Release the leaving blobber.
    let mut old_node = blobber::get(ctx, removed)?;
    old_node.allocated = old_node.allocated.saturating_sub(ba_size);
    old_node.saved_data = old_node.saved_data.saturating_sub(ba_used);
    blobber::save(ctx, &old_node)?;
    let mut old_pool = stake_pool::get(ctx, ProviderType::Blobber, removed)?;
    old_pool.release_offer(&allocation.id);
    stake_pool::save(ctx, ProviderType::Blobber, removed, &old_pool)?;

    let name = keys::blobber_allocations_parts_name(removed);
    let mut parts = Partitions::<ServedAllocation>::open(ctx.store(), &name, PARTITION_SIZE)?;
    if parts.contains(ctx.store(), &allocation.id)? {
        parts.remove(ctx.store_mut(), &allocation.id)?;
    }

    // Wire in the replacement.
    let bsize = allocation.bsize();
    let expiration = allocation.expiration;
    {
        let ba = &mut allocation.blobber_allocs[position];
        ba.blobber_id = added.clone();
        ba.terms = node.terms;
        ba.allocation_root = String::new();
        ba.prev_allocation_root = String::new();
    }

    let mut new_node = node;
    new_node.allocated = new_node
        .allocated
        .checked_add(ba_size)
        .ok_or_else(|| Error::overflow("blobber allocated"))?;
    let write_price = new_node.terms.write_price;
    blobber::save(ctx, &new_node)?;
    let mut new_pool = stake_pool::get(ctx, ProviderType::Blobber, added)?;
    new_pool.add_offer(&allocation.id, price_of(bsize, write_price)?, expiration)?;
    stake_pool::save(ctx, ProviderType::Blobber, added, &new_pool)?;

    let name = keys::blobber_allocations_parts_name(added);
    let mut parts = Partitions::<ServedAllocation>::open(ctx.store(), &name, PARTITION_SIZE)?;
    parts.add(
        ctx.store_mut(),
        &ServedAllocation {
            allocation_id: allocation.id.clone(),
        },
    )?;

    for id in [removed, added] {
        let stake = stake_pool::get(ctx, ProviderType::Blobber, id)?.stake();
        blobber::refresh_challenge_ready(ctx, id, stake)?;
    }
    Ok(())
}

// --- cancel / finalize ------------------------------------------------

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct AllocationRequest {
    pub allocation_id: AllocationId,
}

/// `cancel_allocation_request` — owner-only early termination. Charges the
/// cancellation fee against the write pool, proportional to the stake
/// committed by offers, then settles.
pub fn do_cancel_allocation_request(
    ctx: &mut Context,
    request: AllocationRequest,
) -> Result<(), Error> {
    let config = ctx.config()?;
    let now = ctx.now();
    let mut allocation = get_active(ctx, &request.allocation_id)?;
    if ctx.txn.client_id != allocation.owner {
        return Err(Error::Auth("only owner can cancel the allocation".into()));
    }
    if now >= allocation.expiration {
        return Err(Error::InvalidStateTransition(
            "allocation is expired, finalize it instead".into(),
        ));
    }

    challenge::close_open_challenges(ctx, &mut allocation)?;

    let mut committed = Coin::ZERO;
    for ba in &allocation.blobber_allocs {
        let pool = stake_pool::get(ctx, ProviderType::Blobber, &ba.blobber_id)?;
        if let Some(offer) = pool.offer(&allocation.id) {
            committed = committed
                .checked_add(offer.lock)
                .ok_or_else(|| Error::overflow("committed stake"))?;
        }
    }
    let fee = committed
        .portion(config.cancellation_charge)
        .min(allocation.write_pool);
    allocation.write_pool = allocation.write_pool.saturating_sub(fee);

    settle(ctx, &mut allocation, fee)?;
    allocation.canceled = true;
    save(ctx, &allocation)?;
    ctx.emit(Event::AllocationCanceled {
        allocation_id: allocation.id.clone(),
    });
    log::debug!(target: "allocation", "allocation {} canceled, fee {fee}", allocation.id);
    Ok(())
}

/// `finalize_allocation` — anyone may settle an expired allocation.
pub fn do_finalize_allocation(ctx: &mut Context, request: AllocationRequest) -> Result<(), Error> {
    let now = ctx.now();
    let mut allocation = get_active(ctx, &request.allocation_id)?;
    if now < allocation.expiration {
        return Err(Error::InvalidStateTransition(
            "allocation is not expired yet".into(),
        ));
    }

    challenge::close_open_challenges(ctx, &mut allocation)?;
    settle(ctx, &mut allocation, Coin::ZERO)?;
    allocation.finalized = true;
    save(ctx, &allocation)?;
    ctx.emit(Event::AllocationFinalized {
        allocation_id: allocation.id.clone(),
    });
    log::debug!(target: "allocation", "allocation {} finalized", allocation.id);
    Ok(())
}

/// Shared termination: drains the challenge pool to the blobbers weighted
/// by `write_price * pass_rate` (plus the cancellation fee under the same
/// weights), releases offers and capacity, and returns the remainder to
/// the owner. Each blobber payout is floored once; the truncation
/// remainder flows back to the owner with the residual write pool.
fn settle(ctx: &mut Context, allocation: &mut StorageAllocation, fee: Coin) -> Result<(), Error> {
    let mut pool = challenge_pool::get(ctx, &allocation.id)?;
    let weights: Vec<f64> = allocation
        .blobber_allocs
        .iter()
        .map(|ba| ba.terms.write_price.as_f64() * ba.pass_rate())
        .collect();
    let total_weight: f64 = weights.iter().sum();

    let payable = pool
        .balance
        .checked_add(fee)
        .ok_or_else(|| Error::overflow("settlement total"))?;
    let mut paid = Coin::ZERO;
    if total_weight > 0.0 && !payable.is_zero() {
        for (index, weight) in weights.iter().enumerate() {
            let reward = Coin::from_float_floor(payable.as_f64() * weight / total_weight)
                .ok_or_else(|| Error::overflow("settlement reward"))?;
            if reward.is_zero() {
                continue;
            }
            let blobber_id = allocation.blobber_allocs[index].blobber_id.clone();
            let mut sp = stake_pool::get(ctx, ProviderType::Blobber, &blobber_id)?;
            sp.distribute_reward(reward)?;
            stake_pool::save(ctx, ProviderType::Blobber, &blobber_id, &sp)?;
            let ba = &mut allocation.blobber_allocs[index];
            ba.spent = ba.spent.saturating_add(reward);
            ba.challenge_pool_integral_value = Coin::ZERO;
            paid = paid.saturating_add(reward);
            ctx.emit(Event::Reward {
                provider_id: blobber_id,
                amount: reward,
            });
        }
    }

    // Offers, capacity, sampling partitions.
    for index in 0..allocation.blobber_allocs.len() {
        let (blobber_id, ba_size, ba_used) = {
            let ba = &allocation.blobber_allocs[index];
            (ba.blobber_id.clone(), ba.size, ba.stats.used_size)
        };
        let mut sp = stake_pool::get(ctx, ProviderType::Blobber, &blobber_id)?;
        sp.release_offer(&allocation.id);
        stake_pool::save(ctx, ProviderType::Blobber, &blobber_id, &sp)?;

        if let Some(mut node) = blobber::maybe_get(ctx, &blobber_id)? {
            node.allocated = node.allocated.saturating_sub(ba_size);
            node.saved_data = node.saved_data.saturating_sub(ba_used);
            blobber::save(ctx, &node)?;
        }
        let name = keys::blobber_allocations_parts_name(&blobber_id);
        let mut parts = Partitions::<ServedAllocation>::open(ctx.store(), &name, PARTITION_SIZE)?;
        if parts.contains(ctx.store(), &allocation.id)? {
            parts.remove(ctx.store_mut(), &allocation.id)?;
        }
        let stake = stake_pool::get(ctx, ProviderType::Blobber, &blobber_id)?.stake();
        blobber::refresh_challenge_ready(ctx, &blobber_id, stake)?;
    }

    // The fee and the pool balance were merged into `payable`; everything
    // payable that was not paid returns to the owner with the residual
    // write pool.
    let refund = allocation
        .write_pool
        .checked_add(payable.saturating_sub(paid))
        .ok_or_else(|| Error::overflow("owner refund"))?;
    allocation.write_pool = Coin::ZERO;
    pool.balance = Coin::ZERO;
    challenge_pool::delete(ctx, &allocation.id)?;
    ctx.transfer(keys::ADDRESS, &allocation.owner.clone(), refund);
    Ok(())
}

// --- write pool -------------------------------------------------------

/// `write_pool_lock` — anyone may top up an active allocation's write pool.
pub fn do_write_pool_lock(ctx: &mut Context, request: AllocationRequest) -> Result<(), Error> {
    let config = ctx.config()?;
    let amount = ctx.txn.value;
    if amount < config.write_pool.min_lock {
        return Err(Error::ConstraintViolation(format!(
            "lock amount {amount} is below write pool min_lock {}",
            config.write_pool.min_lock
        )));
    }
    let mut allocation = get_active(ctx, &request.allocation_id)?;
    allocation.write_pool = allocation
        .write_pool
        .checked_add(amount)
        .ok_or_else(|| Error::overflow("write pool"))?;
    save(ctx, &allocation)?;
    ctx.transfer(&ctx.txn.client_id.clone(), keys::ADDRESS, amount);
    Ok(())
}

/// `write_pool_unlock` — the owner reclaims the residual write pool of a
/// terminated allocation. Settlement normally returns it already; this is
/// the escape hatch for balances that arrive afterwards.
pub fn do_write_pool_unlock(ctx: &mut Context, request: AllocationRequest) -> Result<Coin, Error> {
    let mut allocation = get(ctx, &request.allocation_id)?;
    if ctx.txn.client_id != allocation.owner {
        return Err(Error::Auth("only owner can unlock the write pool".into()));
    }
    if allocation.is_active() {
        return Err(Error::InvalidStateTransition(
            "allocation is still active".into(),
        ));
    }
    if allocation.write_pool.is_zero() {
        return Err(Error::NotFound("write pool is empty".into()));
    }
    let amount = allocation.write_pool;
    allocation.write_pool = Coin::ZERO;
    save(ctx, &allocation)?;
    ctx.transfer(keys::ADDRESS, &allocation.owner.clone(), amount);
    Ok(amount)
}

// --- curators ---------------------------------------------------------

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct CuratorRequest {
    pub allocation_id: AllocationId,
    pub curator_id: ClientId,
}

/// `add_curator` — owner-only.
pub fn do_add_curator(ctx: &mut Context, request: CuratorRequest) -> Result<(), Error> {
    let mut allocation = get_active(ctx, &request.allocation_id)?;
    if ctx.txn.client_id != allocation.owner {
        return Err(Error::Auth("only owner can add curators".into()));
    }
    if allocation.curators.contains(&request.curator_id) {
        return Err(Error::AlreadyExists(format!(
            "curator {}",
            request.curator_id
        )));
    }
    allocation.curators.push(request.curator_id);
    save(ctx, &allocation)?;
    ctx.emit(Event::AllocationUpdated {
        allocation_id: allocation.id.clone(),
    });
    Ok(())
}

/// `remove_curator` — owner-only.
pub fn do_remove_curator(ctx: &mut Context, request: CuratorRequest) -> Result<(), Error> {
    let mut allocation = get_active(ctx, &request.allocation_id)?;
    if ctx.txn.client_id != allocation.owner {
        return Err(Error::Auth("only owner can remove curators".into()));
    }
    let position = allocation
        .curators
        .iter()
        .position(|c| *c == request.curator_id)
        .ok_or_else(|| Error::NotFound(format!("curator {}", request.curator_id)))?;
    allocation.curators.remove(position);
    save(ctx, &allocation)?;
    Ok(())
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct TransferAllocationRequest {
    pub allocation_id: AllocationId,
    pub new_owner: ClientId,
    pub new_owner_public_key: String,
}

/// `curator_transfer_allocation` — a curator hands the allocation to a new
/// owner. Future write markers verify against the new key.
pub fn do_curator_transfer_allocation(
    ctx: &mut Context,
    request: TransferAllocationRequest,
) -> Result<(), Error> {
    let mut allocation = get_active(ctx, &request.allocation_id)?;
    if !allocation.curators.contains(&ctx.txn.client_id) {
        return Err(Error::Auth("only a curator can transfer the allocation".into()));
    }
    if request.new_owner.is_empty() || request.new_owner_public_key.is_empty() {
        return Err(Error::InvalidInput("new owner and public key are required".into()));
    }

    let mut owned: Vec<AllocationId> = ctx
        .get(&keys::client_allocations_key(&allocation.owner))?
        .unwrap_or_default();
    owned.retain(|id| *id != allocation.id);
    ctx.put(&keys::client_allocations_key(&allocation.owner), &owned)?;

    allocation.owner = request.new_owner;
    allocation.owner_public_key = request.new_owner_public_key;
    save(ctx, &allocation)?;

    let mut owned: Vec<AllocationId> = ctx
        .get(&keys::client_allocations_key(&allocation.owner))?
        .unwrap_or_default();
    owned.push(allocation.id.clone());
    ctx.put(&keys::client_allocations_key(&allocation.owner), &owned)?;

    ctx.emit(Event::AllocationUpdated {
        allocation_id: allocation.id,
    });
    Ok(())
}
