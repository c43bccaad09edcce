//! Per-provider delegated stake.
//!
//! A stake pool holds one delegate pool per staking wallet, the offers
//! reserved against allocations, and reward accumulators. The standing
//! invariant is `total_offers <= stake()`: committed offers never exceed
//! live stake, checked when offers are added and when delegates unlock.
//!
//! Reward splits truncate at every site: the service charge is
//! `floor(amount * service_charge)`, each delegate gets
//! `floor(rest * balance / stake)`, and the integer leftover accrues to the
//! delegate wallet's accumulator so no coin is ever lost or invented.

use std::collections::BTreeMap;

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use sp_arithmetic::Perbill;

use smp_types::{AllocationId, ClientId, Coin, ProviderId, ProviderType, Timestamp};

use crate::config::Config;
use crate::context::Context;
use crate::error::Error;
use crate::events::Event;
use crate::keys;

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct StakePoolSettings {
    pub delegate_wallet: ClientId,
    pub service_charge: Perbill,
    pub max_delegates: u32,
}

impl StakePoolSettings {
    pub fn validate(&self, config: &Config) -> Result<(), Error> {
        if self.delegate_wallet.is_empty() {
            return Err(Error::InvalidInput("delegate wallet must not be empty".into()));
        }
        if self.service_charge > config.max_charge {
            return Err(Error::ConstraintViolation(format!(
                "service charge exceeds max_charge {:?}",
                config.max_charge
            )));
        }
        if self.max_delegates == 0 || self.max_delegates > config.max_delegates {
            return Err(Error::ConstraintViolation(format!(
                "max_delegates must lie in [1, {}]",
                config.max_delegates
            )));
        }
        Ok(())
    }
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug, Default, PartialEq, Eq)]
pub struct DelegatePool {
    pub balance: Coin,
    pub reward: Coin,
}

/// A reservation against this pool for one allocation.
#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct Offer {
    pub lock: Coin,
    pub expire: Timestamp,
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct StakePool {
    pub pools: BTreeMap<ClientId, DelegatePool>,
    pub offers: BTreeMap<AllocationId, Offer>,
    pub total_offers: Coin,
    /// Service-charge accumulator, withdrawn by the delegate wallet.
    pub reward: Coin,
    pub settings: StakePoolSettings,
}

impl StakePool {
    pub fn new(settings: StakePoolSettings) -> Self {
        StakePool {
            pools: BTreeMap::new(),
            offers: BTreeMap::new(),
            total_offers: Coin::ZERO,
            reward: Coin::ZERO,
            settings,
        }
    }

    /// Total live stake across delegate pools.
    pub fn stake(&self) -> Coin {
        self.pools
            .values()
            .fold(Coin::ZERO, |acc, p| acc.saturating_add(p.balance))
    }

    /// Stake not reserved by offers.
    pub fn free_stake(&self) -> Coin {
        self.stake().saturating_sub(self.total_offers)
    }

    pub fn add_offer(
        &mut self,
        allocation_id: &AllocationId,
        lock: Coin,
        expire: Timestamp,
    ) -> Result<(), Error> {
        if self.offers.contains_key(allocation_id) {
            return Err(Error::AlreadyExists(format!(
                "offer for allocation {allocation_id}"
            )));
        }
        if self.free_stake() < lock {
            return Err(Error::ConstraintViolation(format!(
                "insufficient free stake: need {lock}, have {}",
                self.free_stake()
            )));
        }
        self.offers
            .insert(allocation_id.clone(), Offer { lock, expire });
        self.total_offers = self
            .total_offers
            .checked_add(lock)
            .ok_or_else(|| Error::overflow("total offers"))?;
        Ok(())
    }

    pub fn release_offer(&mut self, allocation_id: &AllocationId) -> Option<Offer> {
        let offer = self.offers.remove(allocation_id)?;
        self.total_offers = self.total_offers.saturating_sub(offer.lock);
        Some(offer)
    }

    pub fn offer(&self, allocation_id: &AllocationId) -> Option<&Offer> {
        self.offers.get(allocation_id)
    }

    /// Splits `amount` into the service charge and balance-weighted delegate
    /// shares. With no delegates everything goes to the delegate wallet.
    pub fn distribute_reward(&mut self, amount: Coin) -> Result<(), Error> {
        if amount.is_zero() {
            return Ok(());
        }
        let service = amount.portion(self.settings.service_charge);
        let mut rest = amount.saturating_sub(service);
        let stake = self.stake();
        let mut credited = Coin::ZERO;
        if !stake.is_zero() {
            for pool in self.pools.values_mut() {
                let share = rest
                    .mul_div(pool.balance.as_u64(), stake.as_u64())
                    .ok_or_else(|| Error::overflow("delegate reward share"))?;
                pool.reward = pool
                    .reward
                    .checked_add(share)
                    .ok_or_else(|| Error::overflow("delegate reward"))?;
                credited = credited.saturating_add(share);
            }
        }
        // Truncation leftover (or the whole rest when unstaked) goes to the
        // delegate wallet accumulator.
        rest = rest.saturating_sub(credited);
        self.reward = self
            .reward
            .checked_add(service)
            .and_then(|r| r.checked_add(rest))
            .ok_or_else(|| Error::overflow("service charge reward"))?;
        Ok(())
    }

    /// Removes up to `amount` from delegate balances, balance-weighted, and
    /// returns what was actually taken (capped by the live stake).
    pub fn slash(&mut self, amount: Coin) -> Coin {
        let stake = self.stake();
        if amount.is_zero() || stake.is_zero() {
            return Coin::ZERO;
        }
        let target = amount.min(stake);
        let mut taken = Coin::ZERO;
        for pool in self.pools.values_mut() {
            let share = pool
                .balance
                .mul_div(target.as_u64(), stake.as_u64())
                .unwrap_or(Coin::ZERO);
            pool.balance = pool.balance.saturating_sub(share);
            taken = taken.saturating_add(share);
        }
        // Truncation remainder, drawn from whichever pools still have funds.
        let mut remainder = target.saturating_sub(taken);
        for pool in self.pools.values_mut() {
            if remainder.is_zero() {
                break;
            }
            let take = pool.balance.min(remainder);
            pool.balance = pool.balance.saturating_sub(take);
            remainder = remainder.saturating_sub(take);
            taken = taken.saturating_add(take);
        }
        taken
    }
}

pub fn get(
    ctx: &Context,
    provider_type: ProviderType,
    provider_id: &ProviderId,
) -> Result<StakePool, Error> {
    ctx.require(
        &keys::stake_pool_key(provider_type, provider_id),
        &format!("stake pool of {} {provider_id}", provider_type.as_str()),
    )
}

pub fn save(
    ctx: &mut Context,
    provider_type: ProviderType,
    provider_id: &ProviderId,
    pool: &StakePool,
) -> Result<(), Error> {
    debug_assert!(pool.total_offers <= pool.stake() || pool.pools.is_empty());
    ctx.put(&keys::stake_pool_key(provider_type, provider_id), pool)
}

/// Input of `stake_pool_lock`, `stake_pool_unlock` and `collect_reward`.
#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct StakePoolRequest {
    pub provider_type: ProviderType,
    pub provider_id: ProviderId,
}

fn provider_status_allows_staking(
    ctx: &Context,
    request: &StakePoolRequest,
) -> Result<(), Error> {
    use crate::provider::ProviderStatus;
    let status = match request.provider_type {
        ProviderType::Blobber => crate::blobber::get(ctx, &request.provider_id)?.status,
        ProviderType::Validator => crate::validator::get(ctx, &request.provider_id)?.status,
    };
    if status != ProviderStatus::Active {
        return Err(Error::InvalidStateTransition(format!(
            "provider {} is {}",
            request.provider_id,
            status.as_str()
        )));
    }
    Ok(())
}

/// `stake_pool_lock` — the caller delegates `tx.value` to a provider.
pub fn do_stake_pool_lock(ctx: &mut Context, request: StakePoolRequest) -> Result<(), Error> {
    let config = ctx.config()?;
    let amount = ctx.txn.value;
    if amount < config.min_stake || amount < config.stake_pool.min_lock {
        return Err(Error::ConstraintViolation(format!(
            "stake {amount} is below the minimum"
        )));
    }
    provider_status_allows_staking(ctx, &request)?;

    let mut pool = get(ctx, request.provider_type, &request.provider_id)?;
    let delegate = ctx.txn.client_id.clone();
    if !pool.pools.contains_key(&delegate)
        && pool.pools.len() as u32 >= pool.settings.max_delegates
    {
        return Err(Error::ConstraintViolation(format!(
            "delegate limit {} reached",
            pool.settings.max_delegates
        )));
    }
    let entry = pool.pools.entry(delegate.clone()).or_default();
    entry.balance = entry
        .balance
        .checked_add(amount)
        .ok_or_else(|| Error::overflow("delegate balance"))?;
    if pool.stake() > config.max_stake {
        return Err(Error::ConstraintViolation(format!(
            "total stake would exceed max_stake {}",
            config.max_stake
        )));
    }
    save(ctx, request.provider_type, &request.provider_id, &pool)?;
    on_stake_changed(ctx, request.provider_type, &request.provider_id, &pool)?;

    ctx.transfer(&delegate, keys::ADDRESS, amount);
    ctx.emit(Event::StakePoolUpdated {
        provider_id: request.provider_id.clone(),
    });
    log::debug!(target: "stake_pool", "{delegate} locked {amount} on {}", request.provider_id);
    Ok(())
}

/// `stake_pool_unlock` — the caller withdraws its whole delegate pool.
/// Refused while the remaining stake would no longer cover outstanding
/// offers.
pub fn do_stake_pool_unlock(ctx: &mut Context, request: StakePoolRequest) -> Result<(), Error> {
    let mut pool = get(ctx, request.provider_type, &request.provider_id)?;
    let delegate = ctx.txn.client_id.clone();
    let delegate_pool = pool
        .pools
        .get(&delegate)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("delegate pool of {delegate}")))?;

    let remaining = pool.stake().saturating_sub(delegate_pool.balance);
    if remaining < pool.total_offers {
        return Err(Error::ConstraintViolation(
            "stake is reserved by outstanding offers".into(),
        ));
    }
    pool.pools.remove(&delegate);
    save(ctx, request.provider_type, &request.provider_id, &pool)?;
    on_stake_changed(ctx, request.provider_type, &request.provider_id, &pool)?;

    let payout = delegate_pool
        .balance
        .checked_add(delegate_pool.reward)
        .ok_or_else(|| Error::overflow("unlock payout"))?;
    ctx.transfer(keys::ADDRESS, &delegate, payout);
    ctx.emit(Event::StakePoolUpdated {
        provider_id: request.provider_id.clone(),
    });
    log::debug!(target: "stake_pool", "{delegate} unlocked {payout} from {}", request.provider_id);
    Ok(())
}

/// `collect_reward` — withdraws the caller's accrued rewards: its delegate
/// accumulator and, for the delegate wallet, the service-charge accumulator.
pub fn do_collect_reward(ctx: &mut Context, request: StakePoolRequest) -> Result<Coin, Error> {
    let mut pool = get(ctx, request.provider_type, &request.provider_id)?;
    let caller = ctx.txn.client_id.clone();
    let mut payout = Coin::ZERO;

    if let Some(delegate_pool) = pool.pools.get_mut(&caller) {
        payout = payout.saturating_add(delegate_pool.reward);
        delegate_pool.reward = Coin::ZERO;
    }
    if caller == pool.settings.delegate_wallet {
        payout = payout.saturating_add(pool.reward);
        pool.reward = Coin::ZERO;
    }
    if payout.is_zero() {
        return Err(Error::NotFound(format!("no reward accrued for {caller}")));
    }
    save(ctx, request.provider_type, &request.provider_id, &pool)?;

    ctx.transfer(keys::ADDRESS, &caller, payout);
    ctx.emit(Event::Reward {
        provider_id: request.provider_id.clone(),
        amount: payout,
    });
    Ok(payout)
}

/// Keeps the sampling partitions in step with stake movements.
fn on_stake_changed(
    ctx: &mut Context,
    provider_type: ProviderType,
    provider_id: &ProviderId,
    pool: &StakePool,
) -> Result<(), Error> {
    match provider_type {
        ProviderType::Blobber => {
            crate::blobber::refresh_challenge_ready(ctx, provider_id, pool.stake())
        }
        ProviderType::Validator => {
            crate::validator::refresh_partition_weight(ctx, provider_id, pool.stake())
        }
    }
}
