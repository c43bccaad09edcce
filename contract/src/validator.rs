//! Validator registry.
//!
//! Validators attest to challenge outcomes. They mirror the blobber
//! registry without capacity bookkeeping: a record, a stake pool keyed with
//! the validator tag, the sorted id index, and a weighted partition that
//! challenge generation samples attesters from.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use smp_partitions::{PartitionItem, Partitions};
use smp_types::{Coin, ProviderId, ProviderType, Timestamp};

use crate::blobber::PARTITION_SIZE;
use crate::context::Context;
use crate::error::Error;
use crate::events::Event;
use crate::keys;
use crate::provider::{self, ProviderRequest, ProviderStatus};
use crate::stake_pool::{self, StakePool, StakePoolSettings};

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct ValidationNode {
    pub id: ProviderId,
    pub base_url: String,
    /// Hex SEC1 public key validation tickets are verified against.
    pub public_key: String,
    pub last_health_check: Timestamp,
    pub status: ProviderStatus,
    pub stake_pool_settings: StakePoolSettings,
}

impl ValidationNode {
    pub fn is_active(&self) -> bool {
        self.status == ProviderStatus::Active
    }
}

/// Membership record of the validator-sampling partition.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct PartitionValidator {
    pub validator_id: ProviderId,
    pub stake: Coin,
}

impl PartitionItem for PartitionValidator {
    fn name(&self) -> &str {
        &self.validator_id
    }

    fn weight(&self) -> u64 {
        self.stake.tokens() + 1
    }
}

pub fn get(ctx: &Context, id: &ProviderId) -> Result<ValidationNode, Error> {
    ctx.require(&keys::validator_key(id), &format!("validator {id}"))
}

pub fn maybe_get(ctx: &Context, id: &ProviderId) -> Result<Option<ValidationNode>, Error> {
    ctx.get(&keys::validator_key(id))
}

pub fn save(ctx: &mut Context, validator: &ValidationNode) -> Result<(), Error> {
    ctx.put(&keys::validator_key(&validator.id), validator)
}

pub fn index(ctx: &Context) -> Result<Vec<ProviderId>, Error> {
    Ok(ctx.get(&keys::validator_index_key())?.unwrap_or_default())
}

/// `add_validator` — first registration, caller is the validator itself.
pub fn do_add_validator(ctx: &mut Context, input: ValidationNode) -> Result<(), Error> {
    if input.id.is_empty() || input.base_url.is_empty() || input.public_key.is_empty() {
        return Err(Error::InvalidInput(
            "validator id, url and public key are required".into(),
        ));
    }
    if ctx.txn.client_id != input.id {
        return Err(Error::Auth("validators register themselves".into()));
    }
    if maybe_get(ctx, &input.id)?.is_some() {
        return Err(Error::AlreadyExists(format!("validator {}", input.id)));
    }
    let config = ctx.config()?;
    input.stake_pool_settings.validate(&config)?;

    let validator = ValidationNode {
        last_health_check: ctx.now(),
        status: ProviderStatus::Active,
        ..input
    };
    save(ctx, &validator)?;

    let sp_key = keys::stake_pool_key(ProviderType::Validator, &validator.id);
    if ctx.get::<StakePool>(&sp_key)?.is_none() {
        ctx.put(&sp_key, &StakePool::new(validator.stake_pool_settings.clone()))?;
    }

    let mut ids = index(ctx)?;
    if let Err(pos) = ids.binary_search(&validator.id) {
        ids.insert(pos, validator.id.clone());
        ctx.put(&keys::validator_index_key(), &ids)?;
    }

    let name = keys::validator_parts_name();
    let mut parts = Partitions::<PartitionValidator>::open(ctx.store(), &name, PARTITION_SIZE)?;
    parts.add(
        ctx.store_mut(),
        &PartitionValidator {
            validator_id: validator.id.clone(),
            stake: Coin::ZERO,
        },
    )?;

    ctx.emit(Event::ValidatorAdded {
        validator_id: validator.id.clone(),
    });
    log::debug!(target: "registry", "validator {} registered", validator.id);
    Ok(())
}

/// `update_validator_settings` — delegate-wallet only.
pub fn do_update_validator_settings(
    ctx: &mut Context,
    input: ValidationNode,
) -> Result<(), Error> {
    let mut validator = get(ctx, &input.id)?;
    if ctx.txn.client_id != validator.stake_pool_settings.delegate_wallet {
        return Err(Error::Auth(
            "only the delegate wallet can update validator settings".into(),
        ));
    }
    if !validator.is_active() {
        return Err(Error::InvalidStateTransition(format!(
            "validator {} is {}",
            validator.id,
            validator.status.as_str()
        )));
    }
    let config = ctx.config()?;
    input.stake_pool_settings.validate(&config)?;

    validator.base_url = input.base_url;
    validator.stake_pool_settings = input.stake_pool_settings.clone();
    save(ctx, &validator)?;

    let mut pool = stake_pool::get(ctx, ProviderType::Validator, &validator.id)?;
    pool.settings = input.stake_pool_settings;
    stake_pool::save(ctx, ProviderType::Validator, &validator.id, &pool)?;

    ctx.emit(Event::ValidatorUpdated {
        validator_id: validator.id,
    });
    Ok(())
}

/// `validator_health_check` — mirrors the blobber health check.
pub fn do_validator_health_check(ctx: &mut Context) -> Result<(), Error> {
    let id = ctx.txn.client_id.clone();
    let mut validator = get(ctx, &id)?;
    if !validator.is_active() {
        return Err(Error::InvalidStateTransition(format!(
            "validator {id} is {}",
            validator.status.as_str()
        )));
    }
    validator.last_health_check = ctx.now();
    save(ctx, &validator)?;
    ctx.emit(Event::ValidatorUpdated { validator_id: id });
    Ok(())
}

/// `shutdown_validator` — removes the validator from sampling; an empty
/// one (no delegates) is deleted outright.
pub fn do_shutdown_validator(ctx: &mut Context, request: ProviderRequest) -> Result<(), Error> {
    let mut validator = get(ctx, &request.provider_id)?;
    provider::authorize_retirement(ctx, &validator.stake_pool_settings.delegate_wallet, false)?;
    if validator.status == ProviderStatus::Killed {
        return Err(Error::InvalidStateTransition(format!(
            "validator {} is killed",
            validator.id
        )));
    }
    remove_from_partition(ctx, &validator.id)?;

    let pool = stake_pool::get(ctx, ProviderType::Validator, &validator.id)?;
    if pool.pools.is_empty() {
        ctx.delete(&keys::validator_key(&validator.id))?;
        ctx.delete(&keys::stake_pool_key(ProviderType::Validator, &validator.id))?;
        let mut ids = index(ctx)?;
        if let Ok(pos) = ids.binary_search(&validator.id) {
            ids.remove(pos);
            ctx.put(&keys::validator_index_key(), &ids)?;
        }
    } else {
        validator.status = ProviderStatus::ShutDown;
        save(ctx, &validator)?;
    }

    ctx.emit(Event::ValidatorShutDown {
        validator_id: request.provider_id,
    });
    Ok(())
}

/// `kill_validator` — owner-only; slashes the stake pool by the kill ratio.
pub fn do_kill_validator(ctx: &mut Context, request: ProviderRequest) -> Result<(), Error> {
    let mut validator = get(ctx, &request.provider_id)?;
    provider::authorize_retirement(ctx, &validator.stake_pool_settings.delegate_wallet, true)?;
    if validator.status == ProviderStatus::Killed {
        return Err(Error::InvalidStateTransition(format!(
            "validator {} is already killed",
            validator.id
        )));
    }
    let config = ctx.config()?;
    let mut pool = stake_pool::get(ctx, ProviderType::Validator, &validator.id)?;
    let taken = pool.slash(pool.stake().portion(config.stake_pool.kill_slash));
    stake_pool::save(ctx, ProviderType::Validator, &validator.id, &pool)?;

    validator.status = ProviderStatus::Killed;
    save(ctx, &validator)?;
    remove_from_partition(ctx, &validator.id)?;

    ctx.emit(Event::ValidatorKilled {
        validator_id: validator.id.clone(),
    });
    log::warn!(target: "registry", "validator {} killed, {taken} slashed", validator.id);
    Ok(())
}

/// Updates the validator's sampling weight after a stake movement.
pub fn refresh_partition_weight(
    ctx: &mut Context,
    validator_id: &ProviderId,
    stake: Coin,
) -> Result<(), Error> {
    let name = keys::validator_parts_name();
    let mut parts = Partitions::<PartitionValidator>::open(ctx.store(), &name, PARTITION_SIZE)?;
    if parts.contains(ctx.store(), validator_id)? {
        parts.update(
            ctx.store_mut(),
            &PartitionValidator {
                validator_id: validator_id.clone(),
                stake,
            },
        )?;
    }
    Ok(())
}

fn remove_from_partition(ctx: &mut Context, validator_id: &ProviderId) -> Result<(), Error> {
    let name = keys::validator_parts_name();
    let mut parts = Partitions::<PartitionValidator>::open(ctx.store(), &name, PARTITION_SIZE)?;
    if parts.contains(ctx.store(), validator_id)? {
        parts.remove(ctx.store_mut(), validator_id)?;
    }
    Ok(())
}
