//! Process-wide configuration.
//!
//! The persisted [`Config`] record is the singleton under the `config` key.
//! It is re-read from state at the start of every operation and never cached
//! across transactions. Genesis values come from a TOML source whose keys
//! live under `smart_contracts.storagesc.*`; ratios are given there as
//! floats and converted once into [`Perbill`].

use codec::{Decode, Encode};
use scale_info::TypeInfo;
use serde::Deserialize;
use sp_arithmetic::Perbill;

use smp_types::{ClientId, Coin, PriceRange, Timestamp};

use crate::context::Context;
use crate::error::Error;
use crate::events::Event;

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct ReadPoolConfig {
    pub min_lock: Coin,
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct WritePoolConfig {
    pub min_lock: Coin,
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct StakePoolConfig {
    pub min_lock: Coin,
    /// Fraction of every delegate balance burned when a provider is killed.
    pub kill_slash: Perbill,
}

/// Shape of allocations created through free-storage markers.
#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct FreeAllocationSettings {
    pub data_shards: u32,
    pub parity_shards: u32,
    pub size: u64,
    /// Lease duration in seconds, measured from the granting transaction.
    pub duration: u64,
    pub read_price_range: PriceRange,
    pub write_price_range: PriceRange,
}

/// Block-reward schedule parameters. `gamma` and `zeta` shape the stake
/// curve and must both be positive; they are dimensionless counts.
#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct BlockReward {
    pub block_reward: Coin,
    pub gamma: u64,
    pub zeta: u64,
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Denominator of write prices: one paid "period" in seconds.
    pub time_unit: u64,
    pub max_mint: Coin,
    /// Running total of minted tokens; never exceeds `max_mint`.
    pub minted: Coin,
    pub min_alloc_size: u64,
    pub max_challenge_completion_rounds: u64,
    pub min_blobber_capacity: u64,
    pub read_pool: ReadPoolConfig,
    pub write_pool: WritePoolConfig,
    pub stake_pool: StakePoolConfig,
    /// Share of every challenge payout routed to its validators.
    pub validator_reward: Perbill,
    /// Fraction of the blobber's risk slashed on a failed challenge.
    pub blobber_slash: Perbill,
    pub health_check_period: u64,
    pub max_blobbers_per_allocation: u32,
    pub max_read_price: Coin,
    pub min_write_price: Coin,
    pub max_write_price: Coin,
    /// Fraction of committed stake charged on early cancellation.
    pub cancellation_charge: Perbill,
    /// Ratio driving each blobber's minimum lock demand.
    pub min_lock_demand: Perbill,
    pub free_allocation_settings: FreeAllocationSettings,
    pub challenge_enabled: bool,
    pub max_challenges_per_generation: u32,
    pub validators_per_challenge: u32,
    /// Challenges generated per mebibyte of stored data per minute.
    pub challenge_rate_per_mb_min: u64,
    pub min_stake: Coin,
    pub max_stake: Coin,
    pub max_delegates: u32,
    /// Upper bound on any provider's service charge ratio.
    pub max_charge: Perbill,
    pub block_reward: BlockReward,
    pub owner_id: ClientId,
}

impl Config {
    /// Bounds enforced on every write of the record.
    pub fn validate(&self) -> Result<(), Error> {
        let fail = |reason: &str| Err(Error::ConstraintViolation(format!("config: {reason}")));
        if self.time_unit == 0 {
            return fail("time_unit must be positive");
        }
        if self.minted > self.max_mint {
            return fail("minted exceeds max_mint");
        }
        if self.min_alloc_size == 0 {
            return fail("min_alloc_size must be positive");
        }
        if self.max_challenge_completion_rounds == 0 {
            return fail("max_challenge_completion_rounds must be positive");
        }
        if self.health_check_period == 0 {
            return fail("health_check_period must be positive");
        }
        if self.max_blobbers_per_allocation == 0 {
            return fail("max_blobbers_per_allocation must be positive");
        }
        if self.min_write_price > self.max_write_price {
            return fail("min_write_price exceeds max_write_price");
        }
        if self.min_stake > self.max_stake {
            return fail("min_stake exceeds max_stake");
        }
        if self.max_delegates == 0 {
            return fail("max_delegates must be at least 1");
        }
        if self.validators_per_challenge == 0 {
            return fail("validators_per_challenge must be positive");
        }
        if self.block_reward.gamma == 0 || self.block_reward.zeta == 0 {
            return fail("block reward gamma and zeta must be positive");
        }
        if self.owner_id.is_empty() {
            return fail("owner_id must not be empty");
        }
        let free = &self.free_allocation_settings;
        if free.data_shards == 0 {
            return fail("free allocation data_shards must be positive");
        }
        if !free.read_price_range.is_valid() || !free.write_price_range.is_valid() {
            return fail("free allocation price range inverted");
        }
        Ok(())
    }

    /// Remaining paid duration in whole and fractional time units.
    pub fn duration_in_time_units(&self, from: Timestamp, until: Timestamp) -> f64 {
        until.saturating_sub(from) as f64 / self.time_unit as f64
    }

    pub fn from_toml(text: &str) -> Result<Config, Error> {
        let file: SettingsFile = toml::from_str(text)
            .map_err(|e| Error::InvalidInput(format!("config toml: {e}")))?;
        file.smart_contracts.storagesc.try_into()
    }
}

/// `update_config` — the contract owner replaces the singleton wholesale.
/// The running minted total carries over; it is bookkeeping, not policy.
pub fn do_update_config(ctx: &mut Context, mut new_config: Config) -> Result<(), Error> {
    let current = ctx.config()?;
    if ctx.txn.client_id != current.owner_id {
        return Err(Error::Auth(
            "only the contract owner can update the config".into(),
        ));
    }
    new_config.minted = current.minted;
    ctx.put_config(&new_config)?;
    ctx.emit(Event::ConfigUpdated);
    Ok(())
}

fn ratio(value: f64, what: &str) -> Result<Perbill, Error> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::ConstraintViolation(format!(
            "config: {what} must lie in [0, 1]"
        )));
    }
    Ok(Perbill::from_float(value))
}

// Genesis settings as they appear in the TOML source. All ratios are floats
// here; `Config` holds them as Perbill.

#[derive(Deserialize)]
struct SettingsFile {
    smart_contracts: SmartContractsSection,
}

#[derive(Deserialize)]
struct SmartContractsSection {
    storagesc: Settings,
}

#[derive(Deserialize)]
struct PoolSettings {
    min_lock: u64,
    #[serde(default)]
    kill_slash: f64,
}

#[derive(Deserialize)]
struct FreeAllocationSettingsRaw {
    data_shards: u32,
    parity_shards: u32,
    size: u64,
    duration: u64,
    read_price_min: u64,
    read_price_max: u64,
    write_price_min: u64,
    write_price_max: u64,
}

#[derive(Deserialize)]
struct BlockRewardRaw {
    block_reward: u64,
    gamma: u64,
    zeta: u64,
}

#[derive(Deserialize)]
struct Settings {
    time_unit: u64,
    max_mint: u64,
    min_alloc_size: u64,
    max_challenge_completion_rounds: u64,
    min_blobber_capacity: u64,
    readpool: PoolSettings,
    writepool: PoolSettings,
    stakepool: PoolSettings,
    validator_reward: f64,
    blobber_slash: f64,
    health_check_period: u64,
    max_blobbers_per_allocation: u32,
    max_read_price: u64,
    min_write_price: u64,
    max_write_price: u64,
    cancellation_charge: f64,
    min_lock_demand: f64,
    free_allocation_settings: FreeAllocationSettingsRaw,
    challenge_enabled: bool,
    max_challenges_per_generation: u32,
    validators_per_challenge: u32,
    challenge_rate_per_mb_min: u64,
    min_stake: u64,
    max_stake: u64,
    max_delegates: u32,
    max_charge: f64,
    block_reward: BlockRewardRaw,
    owner_id: String,
}

impl TryFrom<Settings> for Config {
    type Error = Error;

    fn try_from(s: Settings) -> Result<Config, Error> {
        let config = Config {
            time_unit: s.time_unit,
            max_mint: Coin::new(s.max_mint),
            minted: Coin::ZERO,
            min_alloc_size: s.min_alloc_size,
            max_challenge_completion_rounds: s.max_challenge_completion_rounds,
            min_blobber_capacity: s.min_blobber_capacity,
            read_pool: ReadPoolConfig {
                min_lock: Coin::new(s.readpool.min_lock),
            },
            write_pool: WritePoolConfig {
                min_lock: Coin::new(s.writepool.min_lock),
            },
            stake_pool: StakePoolConfig {
                min_lock: Coin::new(s.stakepool.min_lock),
                kill_slash: ratio(s.stakepool.kill_slash, "stakepool.kill_slash")?,
            },
            validator_reward: ratio(s.validator_reward, "validator_reward")?,
            blobber_slash: ratio(s.blobber_slash, "blobber_slash")?,
            health_check_period: s.health_check_period,
            max_blobbers_per_allocation: s.max_blobbers_per_allocation,
            max_read_price: Coin::new(s.max_read_price),
            min_write_price: Coin::new(s.min_write_price),
            max_write_price: Coin::new(s.max_write_price),
            cancellation_charge: ratio(s.cancellation_charge, "cancellation_charge")?,
            min_lock_demand: ratio(s.min_lock_demand, "min_lock_demand")?,
            free_allocation_settings: FreeAllocationSettings {
                data_shards: s.free_allocation_settings.data_shards,
                parity_shards: s.free_allocation_settings.parity_shards,
                size: s.free_allocation_settings.size,
                duration: s.free_allocation_settings.duration,
                read_price_range: PriceRange::new(
                    Coin::new(s.free_allocation_settings.read_price_min),
                    Coin::new(s.free_allocation_settings.read_price_max),
                ),
                write_price_range: PriceRange::new(
                    Coin::new(s.free_allocation_settings.write_price_min),
                    Coin::new(s.free_allocation_settings.write_price_max),
                ),
            },
            challenge_enabled: s.challenge_enabled,
            max_challenges_per_generation: s.max_challenges_per_generation,
            validators_per_challenge: s.validators_per_challenge,
            challenge_rate_per_mb_min: s.challenge_rate_per_mb_min,
            min_stake: Coin::new(s.min_stake),
            max_stake: Coin::new(s.max_stake),
            max_delegates: s.max_delegates,
            max_charge: ratio(s.max_charge, "max_charge")?,
            block_reward: BlockReward {
                block_reward: Coin::new(s.block_reward.block_reward),
                gamma: s.block_reward.gamma,
                zeta: s.block_reward.zeta,
            },
            owner_id: s.owner_id,
        };
        config.validate()?;
        Ok(config)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS: &str = r#"
[smart_contracts.storagesc]
time_unit = 720
max_mint = 75000000000000000
min_alloc_size = 1024
max_challenge_completion_rounds = 720
min_blobber_capacity = 1024
validator_reward = 0.025
blobber_slash = 0.1
health_check_period = 3600
max_blobbers_per_allocation = 40
max_read_price = 100000000000
min_write_price = 1
max_write_price = 100000000000
cancellation_charge = 0.2
min_lock_demand = 0.1
challenge_enabled = true
max_challenges_per_generation = 100
validators_per_challenge = 2
challenge_rate_per_mb_min = 1
min_stake = 10
max_stake = 100000000000000
max_delegates = 50
max_charge = 0.5
owner_id = "1746b06bb09f55ee01b33b5e2e055d6cc7a900cb57c0a3a5eaabb8a0e7745802"

[smart_contracts.storagesc.readpool]
min_lock = 10

[smart_contracts.storagesc.writepool]
min_lock = 10

[smart_contracts.storagesc.stakepool]
min_lock = 10
kill_slash = 0.5

[smart_contracts.storagesc.free_allocation_settings]
data_shards = 10
parity_shards = 5
size = 10000000000
duration = 5000000
read_price_min = 0
read_price_max = 5000
write_price_min = 0
write_price_max = 5000

[smart_contracts.storagesc.block_reward]
block_reward = 1000
gamma = 10
zeta = 10
"#;

    #[test]
    fn genesis_toml_parses_and_validates() {
        let config = Config::from_toml(GENESIS).unwrap();
        assert_eq!(config.time_unit, 720);
        assert_eq!(config.validator_reward, Perbill::from_rational(25u64, 1000u64));
        assert_eq!(config.stake_pool.kill_slash, Perbill::from_percent(50));
        assert_eq!(config.free_allocation_settings.parity_shards, 5);
        assert_eq!(config.minted, Coin::ZERO);
    }

    #[test]
    fn out_of_range_ratio_is_rejected() {
        let bad = GENESIS.replace("blobber_slash = 0.1", "blobber_slash = 1.5");
        let err = Config::from_toml(&bad).unwrap_err();
        assert!(err.to_string().contains("blobber_slash"));
    }

    #[test]
    fn inverted_stake_bounds_are_rejected() {
        let mut config = testing::config();
        config.min_stake = Coin::new(100);
        config.max_stake = Coin::new(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn minted_above_cap_is_rejected() {
        let mut config = testing::config();
        config.minted = config.max_mint.checked_add(Coin::new(1)).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_in_time_units_is_fractional() {
        let config = testing::config();
        assert_eq!(config.duration_in_time_units(0, 3600), 1.0);
        assert_eq!(config.duration_in_time_units(0, 1800), 0.5);
        assert_eq!(config.duration_in_time_units(100, 50), 0.0);
    }
}
