//! Blobber registry.
//!
//! A blobber quotes terms, carries capacity bookkeeping (`allocated` bytes
//! promised to allocations, `saved_data` bytes actually written) and owns a
//! stake pool keyed with the blobber tag. Registered blobbers appear in the
//! sorted id index consumed by allocation creation, and in the
//! challenge-ready partition while they are eligible for audits.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use smp_partitions::{PartitionItem, Partitions};
use smp_types::{Coin, ProviderId, ProviderType, Terms, Timestamp, MB};

use crate::context::Context;
use crate::error::Error;
use crate::events::Event;
use crate::keys;
use crate::provider::{self, is_healthy, ProviderRequest, ProviderStatus};
use crate::stake_pool::{self, StakePool, StakePoolSettings};

/// Bucket capacity of the partitions this module maintains.
pub const PARTITION_SIZE: u32 = 50;

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct StorageNode {
    pub id: ProviderId,
    pub base_url: String,
    /// Hex SEC1 public key; write markers name it through the allocation.
    pub public_key: String,
    pub terms: Terms,
    pub capacity: u64,
    /// Bytes promised to live allocations. Never exceeds `capacity`.
    pub allocated: u64,
    /// Bytes actually committed through write markers. Never exceeds
    /// `allocated`.
    pub saved_data: u64,
    pub last_health_check: Timestamp,
    pub status: ProviderStatus,
    pub stake_pool_settings: StakePoolSettings,
}

impl StorageNode {
    pub fn is_active(&self) -> bool {
        self.status == ProviderStatus::Active
    }
}

/// Membership record of the challenge-ready partition. The weight favors
/// well-staked blobbers holding more data, so audits concentrate where the
/// exposure is.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct ChallengeReadyBlobber {
    pub blobber_id: ProviderId,
    pub stake: Coin,
    pub saved_data: u64,
}

impl PartitionItem for ChallengeReadyBlobber {
    fn name(&self) -> &str {
        &self.blobber_id
    }

    fn weight(&self) -> u64 {
        (self.stake.tokens() + 1).saturating_mul(self.saved_data / MB + 1)
    }
}

pub fn get(ctx: &Context, id: &ProviderId) -> Result<StorageNode, Error> {
    ctx.require(&keys::blobber_key(id), &format!("blobber {id}"))
}

pub fn maybe_get(ctx: &Context, id: &ProviderId) -> Result<Option<StorageNode>, Error> {
    ctx.get(&keys::blobber_key(id))
}

pub fn save(ctx: &mut Context, blobber: &StorageNode) -> Result<(), Error> {
    debug_assert!(blobber.allocated <= blobber.capacity);
    debug_assert!(blobber.saved_data <= blobber.allocated);
    ctx.put(&keys::blobber_key(&blobber.id), blobber)
}

/// The sorted index of registered blobber ids.
pub fn index(ctx: &Context) -> Result<Vec<ProviderId>, Error> {
    Ok(ctx.get(&keys::blobber_index_key())?.unwrap_or_default())
}

fn validate_terms(ctx: &Context, terms: &Terms) -> Result<(), Error> {
    let config = ctx.config()?;
    if terms.read_price > config.max_read_price {
        return Err(Error::ConstraintViolation(format!(
            "read price {} exceeds max_read_price {}",
            terms.read_price, config.max_read_price
        )));
    }
    if terms.write_price < config.min_write_price || terms.write_price > config.max_write_price {
        return Err(Error::ConstraintViolation(format!(
            "write price {} outside [{}, {}]",
            terms.write_price, config.min_write_price, config.max_write_price
        )));
    }
    Ok(())
}

/// `add_blobber` — first registration, caller is the blobber itself.
pub fn do_add_blobber(ctx: &mut Context, input: StorageNode) -> Result<(), Error> {
    if input.id.is_empty() || input.base_url.is_empty() || input.public_key.is_empty() {
        return Err(Error::InvalidInput(
            "blobber id, url and public key are required".into(),
        ));
    }
    if ctx.txn.client_id != input.id {
        return Err(Error::Auth("blobbers register themselves".into()));
    }
    if maybe_get(ctx, &input.id)?.is_some() {
        return Err(Error::AlreadyExists(format!("blobber {}", input.id)));
    }
    let config = ctx.config()?;
    validate_terms(ctx, &input.terms)?;
    if input.capacity < config.min_blobber_capacity {
        return Err(Error::ConstraintViolation(format!(
            "capacity {} is below min_blobber_capacity {}",
            input.capacity, config.min_blobber_capacity
        )));
    }
    input.stake_pool_settings.validate(&config)?;

    let blobber = StorageNode {
        allocated: 0,
        saved_data: 0,
        last_health_check: ctx.now(),
        status: ProviderStatus::Active,
        ..input
    };
    save(ctx, &blobber)?;

    let sp_key = keys::stake_pool_key(ProviderType::Blobber, &blobber.id);
    if ctx.get::<StakePool>(&sp_key)?.is_none() {
        ctx.put(&sp_key, &StakePool::new(blobber.stake_pool_settings.clone()))?;
    }

    let mut ids = index(ctx)?;
    if let Err(pos) = ids.binary_search(&blobber.id) {
        ids.insert(pos, blobber.id.clone());
        ctx.put(&keys::blobber_index_key(), &ids)?;
    }

    ctx.emit(Event::BlobberAdded {
        blobber_id: blobber.id.clone(),
    });
    log::debug!(target: "registry", "blobber {} registered", blobber.id);
    Ok(())
}

/// `update_blobber_settings` — delegate-wallet only; replaces the mutable
/// fields after revalidation.
pub fn do_update_blobber_settings(ctx: &mut Context, input: StorageNode) -> Result<(), Error> {
    let mut blobber = get(ctx, &input.id)?;
    if ctx.txn.client_id != blobber.stake_pool_settings.delegate_wallet {
        return Err(Error::Auth(
            "only the delegate wallet can update blobber settings".into(),
        ));
    }
    if !blobber.is_active() {
        return Err(Error::InvalidStateTransition(format!(
            "blobber {} is {}",
            blobber.id,
            blobber.status.as_str()
        )));
    }
    let config = ctx.config()?;
    validate_terms(ctx, &input.terms)?;
    input.stake_pool_settings.validate(&config)?;
    if input.capacity < blobber.allocated {
        return Err(Error::ConstraintViolation(format!(
            "capacity {} is below allocated {}",
            input.capacity, blobber.allocated
        )));
    }
    if input.capacity < config.min_blobber_capacity {
        return Err(Error::ConstraintViolation(format!(
            "capacity {} is below min_blobber_capacity {}",
            input.capacity, config.min_blobber_capacity
        )));
    }

    blobber.terms = input.terms;
    blobber.capacity = input.capacity;
    blobber.stake_pool_settings = input.stake_pool_settings.clone();
    save(ctx, &blobber)?;

    let mut pool = stake_pool::get(ctx, ProviderType::Blobber, &blobber.id)?;
    pool.settings = input.stake_pool_settings;
    stake_pool::save(ctx, ProviderType::Blobber, &blobber.id, &pool)?;

    ctx.emit(Event::BlobberUpdated {
        blobber_id: blobber.id,
    });
    Ok(())
}

/// `blobber_health_check` — the blobber refreshes its liveness timestamp.
pub fn do_blobber_health_check(ctx: &mut Context) -> Result<(), Error> {
    let id = ctx.txn.client_id.clone();
    let mut blobber = get(ctx, &id)?;
    if !blobber.is_active() {
        return Err(Error::InvalidStateTransition(format!(
            "blobber {id} is {}",
            blobber.status.as_str()
        )));
    }
    blobber.last_health_check = ctx.now();
    save(ctx, &blobber)?;

    let stake = stake_pool::get(ctx, ProviderType::Blobber, &id)?.stake();
    refresh_challenge_ready(ctx, &id, stake)?;
    ctx.emit(Event::BlobberUpdated { blobber_id: id });
    Ok(())
}

/// `shutdown_blobber` — soft retirement. Existing allocations and offers
/// persist; an empty blobber (no data, no delegates) is deleted outright.
pub fn do_shutdown_blobber(ctx: &mut Context, request: ProviderRequest) -> Result<(), Error> {
    let mut blobber = get(ctx, &request.provider_id)?;
    provider::authorize_retirement(ctx, &blobber.stake_pool_settings.delegate_wallet, false)?;
    if blobber.status == ProviderStatus::Killed {
        return Err(Error::InvalidStateTransition(format!(
            "blobber {} is killed",
            blobber.id
        )));
    }
    remove_challenge_ready(ctx, &blobber.id)?;

    let pool = stake_pool::get(ctx, ProviderType::Blobber, &blobber.id)?;
    if blobber.saved_data == 0 && pool.pools.is_empty() {
        ctx.delete(&keys::blobber_key(&blobber.id))?;
        ctx.delete(&keys::stake_pool_key(ProviderType::Blobber, &blobber.id))?;
        let mut ids = index(ctx)?;
        if let Ok(pos) = ids.binary_search(&blobber.id) {
            ids.remove(pos);
            ctx.put(&keys::blobber_index_key(), &ids)?;
        }
    } else {
        blobber.status = ProviderStatus::ShutDown;
        save(ctx, &blobber)?;
    }

    ctx.emit(Event::BlobberShutDown {
        blobber_id: request.provider_id,
    });
    Ok(())
}

/// `kill_blobber` — owner-only hard retirement; slashes every delegate by
/// the kill ratio. Offers stay locked against the residual stake until the
/// referring allocations settle.
pub fn do_kill_blobber(ctx: &mut Context, request: ProviderRequest) -> Result<(), Error> {
    let mut blobber = get(ctx, &request.provider_id)?;
    provider::authorize_retirement(ctx, &blobber.stake_pool_settings.delegate_wallet, true)?;
    if blobber.status == ProviderStatus::Killed {
        return Err(Error::InvalidStateTransition(format!(
            "blobber {} is already killed",
            blobber.id
        )));
    }
    let config = ctx.config()?;
    let mut pool = stake_pool::get(ctx, ProviderType::Blobber, &blobber.id)?;
    let slash = pool.stake().portion(config.stake_pool.kill_slash);
    let taken = pool.slash(slash);
    stake_pool::save(ctx, ProviderType::Blobber, &blobber.id, &pool)?;

    blobber.status = ProviderStatus::Killed;
    save(ctx, &blobber)?;
    remove_challenge_ready(ctx, &blobber.id)?;

    ctx.emit(Event::BlobberKilled {
        blobber_id: blobber.id.clone(),
    });
    log::warn!(target: "registry", "blobber {} killed, {taken} slashed", blobber.id);
    Ok(())
}

/// Reconciles the blobber's membership in the challenge-ready partition
/// with its current eligibility: active, healthy and holding allocations.
pub fn refresh_challenge_ready(
    ctx: &mut Context,
    blobber_id: &ProviderId,
    stake: Coin,
) -> Result<(), Error> {
    let Some(blobber) = maybe_get(ctx, blobber_id)? else {
        return Ok(());
    };
    let config = ctx.config()?;
    let eligible = blobber.is_active()
        && is_healthy(blobber.last_health_check, ctx.now(), config.health_check_period)
        && blobber.allocated > 0;

    let name = keys::challenge_ready_parts_name();
    let mut parts =
        Partitions::<ChallengeReadyBlobber>::open(ctx.store(), &name, PARTITION_SIZE)?;
    let present = parts.contains(ctx.store(), blobber_id)?;
    if eligible {
        let item = ChallengeReadyBlobber {
            blobber_id: blobber_id.clone(),
            stake,
            saved_data: blobber.saved_data,
        };
        if present {
            parts.update(ctx.store_mut(), &item)?;
        } else {
            parts.add(ctx.store_mut(), &item)?;
        }
    } else if present {
        parts.remove(ctx.store_mut(), blobber_id)?;
    }
    Ok(())
}

fn remove_challenge_ready(ctx: &mut Context, blobber_id: &ProviderId) -> Result<(), Error> {
    let name = keys::challenge_ready_parts_name();
    let mut parts =
        Partitions::<ChallengeReadyBlobber>::open(ctx.store(), &name, PARTITION_SIZE)?;
    if parts.contains(ctx.store(), blobber_id)? {
        parts.remove(ctx.store_mut(), blobber_id)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing as ctx_testing;
    use smc_state_store::MemStore;

    fn register(base: &mut MemStore, id: &str) {
        let txn = ctx_testing::txn(id, &format!("tx-{id}"), 0, 100);
        let mut ctx = ctx_testing::context(base, txn, 1);
        do_add_blobber(&mut ctx, testing::node(id, 10_000_000_000, 1 << 30)).unwrap();
        ctx.commit().unwrap();
    }

    #[test]
    fn registration_creates_record_pool_and_index() {
        let mut base = MemStore::new();
        register(&mut base, "b2");
        register(&mut base, "b1");

        let txn = ctx_testing::txn("x", "tx-q", 0, 100);
        let ctx = ctx_testing::context(&mut base, txn, 1);
        let blobber = get(&ctx, &"b1".to_string()).unwrap();
        assert_eq!(blobber.allocated, 0);
        assert!(blobber.is_active());
        assert!(stake_pool::get(&ctx, ProviderType::Blobber, &"b1".to_string()).is_ok());
        // Sorted regardless of registration order.
        assert_eq!(index(&ctx).unwrap(), vec!["b1".to_string(), "b2".to_string()]);
    }

    #[test]
    fn duplicate_registration_is_already_exists() {
        let mut base = MemStore::new();
        register(&mut base, "b1");
        let txn = ctx_testing::txn("b1", "tx-again", 0, 100);
        let mut ctx = ctx_testing::context(&mut base, txn, 1);
        let err =
            do_add_blobber(&mut ctx, testing::node("b1", 10_000_000_000, 1 << 30)).unwrap_err();
        assert_eq!(err.to_string(), "already_exists: blobber b1");
    }

    #[test]
    fn registration_by_another_caller_is_auth() {
        let mut base = MemStore::new();
        let txn = ctx_testing::txn("someone-else", "tx", 0, 100);
        let mut ctx = ctx_testing::context(&mut base, txn, 1);
        let err =
            do_add_blobber(&mut ctx, testing::node("b1", 10_000_000_000, 1 << 30)).unwrap_err();
        assert!(err.to_string().starts_with("auth"));
    }

    #[test]
    fn capacity_below_minimum_is_rejected() {
        let mut base = MemStore::new();
        let txn = ctx_testing::txn("b1", "tx", 0, 100);
        let mut ctx = ctx_testing::context(&mut base, txn, 1);
        let err = do_add_blobber(&mut ctx, testing::node("b1", 10_000_000_000, 1)).unwrap_err();
        assert!(err.to_string().contains("min_blobber_capacity"));
    }

    #[test]
    fn settings_update_requires_delegate_wallet() {
        let mut base = MemStore::new();
        register(&mut base, "b1");
        let txn = ctx_testing::txn("b1", "tx-upd", 0, 100);
        let mut ctx = ctx_testing::context(&mut base, txn, 1);
        let err = do_update_blobber_settings(&mut ctx, testing::node("b1", 20_000_000_000, 1 << 30))
            .unwrap_err();
        assert!(err.to_string().starts_with("auth"));
    }

    #[test]
    fn settings_update_cannot_shrink_below_allocated() {
        let mut base = MemStore::new();
        register(&mut base, "b1");
        {
            let txn = ctx_testing::txn("x", "tx-fill", 0, 100);
            let mut ctx = ctx_testing::context(&mut base, txn, 1);
            let mut blobber = get(&ctx, &"b1".to_string()).unwrap();
            blobber.allocated = 1 << 29;
            save(&mut ctx, &blobber).unwrap();
            ctx.commit().unwrap();
        }
        let txn = ctx_testing::txn("b1-wallet", "tx-upd", 0, 100);
        let mut ctx = ctx_testing::context(&mut base, txn, 1);
        let mut update = testing::node("b1", 10_000_000_000, 1 << 28);
        update.capacity = 1 << 28;
        let err = do_update_blobber_settings(&mut ctx, update).unwrap_err();
        assert!(err.to_string().contains("below allocated"));
    }

    #[test]
    fn health_check_adds_eligible_blobber_to_partition() {
        let mut base = MemStore::new();
        register(&mut base, "b1");
        {
            let txn = ctx_testing::txn("x", "tx-fill", 0, 100);
            let mut ctx = ctx_testing::context(&mut base, txn, 1);
            let mut blobber = get(&ctx, &"b1".to_string()).unwrap();
            blobber.allocated = 4096;
            save(&mut ctx, &blobber).unwrap();
            ctx.commit().unwrap();
        }
        {
            let txn = ctx_testing::txn("b1", "tx-hc", 0, 200);
            let mut ctx = ctx_testing::context(&mut base, txn, 2);
            do_blobber_health_check(&mut ctx).unwrap();
            ctx.commit().unwrap();
        }
        let parts = Partitions::<ChallengeReadyBlobber>::open(
            &base,
            &keys::challenge_ready_parts_name(),
            PARTITION_SIZE,
        )
        .unwrap();
        assert!(parts.contains(&base, "b1").unwrap());
    }

    #[test]
    fn shutdown_of_empty_blobber_deletes_it() {
        let mut base = MemStore::new();
        register(&mut base, "b1");
        let txn = ctx_testing::txn("b1-wallet", "tx-sd", 0, 100);
        let mut ctx = ctx_testing::context(&mut base, txn, 1);
        do_shutdown_blobber(
            &mut ctx,
            ProviderRequest {
                provider_id: "b1".to_string(),
            },
        )
        .unwrap();
        assert!(maybe_get(&ctx, &"b1".to_string()).unwrap().is_none());
        assert!(index(&ctx).unwrap().is_empty());
    }

    #[test]
    fn kill_requires_owner_and_slashes() {
        let mut base = MemStore::new();
        register(&mut base, "b1");
        {
            let txn = ctx_testing::txn("d1", "tx-stake", 0, 100);
            let mut ctx = ctx_testing::context(&mut base, txn, 1);
            let mut pool = stake_pool::get(&ctx, ProviderType::Blobber, &"b1".to_string()).unwrap();
            pool.pools.insert(
                "d1".to_string(),
                crate::stake_pool::DelegatePool {
                    balance: Coin::new(1_000),
                    reward: Coin::ZERO,
                },
            );
            stake_pool::save(&mut ctx, ProviderType::Blobber, &"b1".to_string(), &pool).unwrap();
            ctx.commit().unwrap();
        }
        {
            let txn = ctx_testing::txn("not-owner", "tx-kill", 0, 100);
            let mut ctx = ctx_testing::context(&mut base, txn, 1);
            let err = do_kill_blobber(
                &mut ctx,
                ProviderRequest {
                    provider_id: "b1".to_string(),
                },
            )
            .unwrap_err();
            assert!(err.to_string().starts_with("auth"));
        }
        let txn = ctx_testing::txn("owner", "tx-kill", 0, 100);
        let mut ctx = ctx_testing::context(&mut base, txn, 1);
        do_kill_blobber(
            &mut ctx,
            ProviderRequest {
                provider_id: "b1".to_string(),
            },
        )
        .unwrap();
        let blobber = get(&ctx, &"b1".to_string()).unwrap();
        assert_eq!(blobber.status, ProviderStatus::Killed);
        // Half the stake gone under the 50% kill slash of the test config.
        let pool = stake_pool::get(&ctx, ProviderType::Blobber, &"b1".to_string()).unwrap();
        assert_eq!(pool.stake(), Coin::new(500));
    }
}
