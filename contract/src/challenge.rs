//! Challenge engine: generation, verification, reward and penalty.
//!
//! Generation runs once per block, seeded from the block entropy so every
//! replica produces the same challenges. A challenge targets one blobber
//! (weighted pick over the challenge-ready partition), one of its served
//! allocations (uniform), and a distinct validator set (weighted, the
//! blobber excluded). The blobber answers with validator-signed tickets;
//! a strict majority of the required set passing carries the challenge,
//! ties fail.
//!
//! Token flow on close follows the integral value (CPIV) of the blobber:
//! the interval since the last success that was already finalized is
//! forfeited back to the write pool, the interval up to now is paid out.
//! Validators are paid their share from the same move whether the blobber
//! passes or fails; on a hard fail the blobber's stake is slashed by the
//! configured fraction of its risk and the proceeds are credited back to
//! the write pool.

use codec::{Decode, Encode};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use scale_info::TypeInfo;

use smp_partitions::Partitions;
use smp_types::{AllocationId, Coin, ProviderId, ProviderType, Round, Timestamp, MB};

use crate::allocation::{self, ServedAllocation, StorageAllocation};
use crate::blobber::{ChallengeReadyBlobber, PARTITION_SIZE};
use crate::challenge_pool;
use crate::context::Context;
use crate::crypto;
use crate::error::Error;
use crate::events::Event;
use crate::keys;
use crate::provider::ProviderRequest;
use crate::stake_pool;
use crate::validator::{self, PartitionValidator};

#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct StorageChallenge {
    pub id: String,
    pub allocation_id: AllocationId,
    pub blobber_id: ProviderId,
    pub validator_ids: Vec<ProviderId>,
    pub created_round: Round,
    pub created_timestamp: Timestamp,
}

/// Entry of an allocation's open-challenges list.
#[derive(Encode, Decode, TypeInfo, Clone, Debug, PartialEq, Eq)]
pub struct OpenChallenge {
    pub challenge_id: String,
    pub blobber_id: ProviderId,
    pub round_created_at: Round,
}

impl OpenChallenge {
    pub fn is_expired(&self, current_round: Round, max_completion_rounds: Round) -> bool {
        self.round_created_at + max_completion_rounds < current_round
    }
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationChallenges {
    pub open_challenges: Vec<OpenChallenge>,
}

/// Aggregate counters driving the per-block generation rate.
#[derive(Encode, Decode, TypeInfo, Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub total_saved_data: u64,
    pub last_challenge_round: Round,
    pub last_challenge_time: Timestamp,
    pub last_challenge_id: String,
}

pub fn storage_stats(ctx: &Context) -> Result<StorageStats, Error> {
    Ok(ctx.get(&keys::storage_stats_key())?.unwrap_or_default())
}

pub fn save_storage_stats(ctx: &mut Context, stats: &StorageStats) -> Result<(), Error> {
    ctx.put(&keys::storage_stats_key(), stats)
}

fn allocation_challenges(ctx: &Context, id: &AllocationId) -> Result<AllocationChallenges, Error> {
    Ok(ctx
        .get(&keys::allocation_challenges_key(id))?
        .unwrap_or_default())
}

/// Strict majority of the required validator set; ties fail.
pub fn strict_majority(pass: usize, total: usize) -> bool {
    2 * pass > total
}

// --- generation -------------------------------------------------------

/// `generate_challenges` — invoked by the host once per block. The number
/// of challenges scales with stored data and elapsed minutes, capped per
/// generation. Returns how many were created.
pub fn do_generate_challenges(ctx: &mut Context) -> Result<u32, Error> {
    let config = ctx.config()?;
    if !config.challenge_enabled {
        return Ok(0);
    }
    let mut stats = storage_stats(ctx)?;
    if stats.last_challenge_round >= ctx.block.round && stats.last_challenge_round > 0 {
        // Once per round.
        return Ok(0);
    }

    let minutes = if stats.last_challenge_time == 0 {
        1
    } else {
        (ctx.now().saturating_sub(stats.last_challenge_time) / 60).max(1)
    };
    let size_mb = stats.total_saved_data / MB;
    let wanted = config
        .challenge_rate_per_mb_min
        .saturating_mul(minutes)
        .saturating_mul(size_mb)
        .min(config.max_challenges_per_generation as u64) as u32;

    let seed = crypto::hash_raw(&[
        ctx.block.hash.as_bytes(),
        &ctx.block.round.to_le_bytes(),
        b"challenge_seed",
    ]);
    let mut rng = ChaCha20Rng::from_seed(seed);

    let mut created = 0u32;
    for i in 0..wanted {
        let id = crypto::hash_hex(&[
            stats.last_challenge_id.as_bytes(),
            ctx.block.hash.as_bytes(),
            &ctx.block.round.to_le_bytes(),
            &i.to_le_bytes(),
        ]);
        if let Some(challenge_id) = generate_one(ctx, &mut rng, id, None)? {
            stats.last_challenge_id = challenge_id;
            created += 1;
        }
    }

    stats.last_challenge_round = ctx.block.round;
    stats.last_challenge_time = ctx.now();
    save_storage_stats(ctx, &stats)?;
    if created > 0 {
        log::debug!(target: "challenge", "round {}: {created} challenges generated", ctx.block.round);
    }
    Ok(created)
}

/// `challenge_request` — an on-demand challenge against a named blobber,
/// seeded from the requesting transaction.
pub fn do_challenge_request(ctx: &mut Context, request: ProviderRequest) -> Result<String, Error> {
    let seed = crypto::hash_raw(&[ctx.txn.hash.as_bytes(), b"challenge_request"]);
    let mut rng = ChaCha20Rng::from_seed(seed);
    let id = crypto::hash_hex(&[ctx.txn.hash.as_bytes(), b"challenge"]);

    let ready = Partitions::<ChallengeReadyBlobber>::open(
        ctx.store(),
        &keys::challenge_ready_parts_name(),
        PARTITION_SIZE,
    )?;
    if !ready.contains(ctx.store(), &request.provider_id)? {
        return Err(Error::InvalidStateTransition(format!(
            "blobber {} is not challenge ready",
            request.provider_id
        )));
    }
    generate_one(ctx, &mut rng, id, Some(request.provider_id.clone()))?.ok_or_else(|| {
        Error::NotFound(format!(
            "no challengeable allocation on blobber {}",
            request.provider_id
        ))
    })
}

/// Creates one challenge. `target` pins the blobber (on-demand path);
/// otherwise the blobber is sampled by weight. Returns `None` when there
/// is nothing to challenge.
fn generate_one(
    ctx: &mut Context,
    rng: &mut ChaCha20Rng,
    id: String,
    target: Option<ProviderId>,
) -> Result<Option<String>, Error> {
    let config = ctx.config()?;

    let blobber_id = match target {
        Some(id) => id,
        None => {
            let ready = Partitions::<ChallengeReadyBlobber>::open(
                ctx.store(),
                &keys::challenge_ready_parts_name(),
                PARTITION_SIZE,
            )?;
            if ready.is_empty() {
                return Ok(None);
            }
            ready.pick(ctx.store(), rng)?.blobber_id
        }
    };

    let served = Partitions::<ServedAllocation>::open(
        ctx.store(),
        &keys::blobber_allocations_parts_name(&blobber_id),
        PARTITION_SIZE,
    )?;
    if served.is_empty() {
        return Ok(None);
    }
    let allocation_id = served.pick(ctx.store(), rng)?.allocation_id;
    let mut alloc = allocation::get(ctx, &allocation_id)?;
    if !alloc.is_active() || ctx.now() >= alloc.expiration {
        return Ok(None);
    }

    let validators = Partitions::<PartitionValidator>::open(
        ctx.store(),
        &keys::validator_parts_name(),
        PARTITION_SIZE,
    )?;
    let picked = validators.pick_distinct(
        ctx.store(),
        rng,
        config.validators_per_challenge as usize,
        &[blobber_id.as_str()],
    )?;
    if picked.is_empty() {
        return Ok(None);
    }

    let challenge = StorageChallenge {
        id: id.clone(),
        allocation_id: allocation_id.clone(),
        blobber_id: blobber_id.clone(),
        validator_ids: picked.into_iter().map(|v| v.validator_id).collect(),
        created_round: ctx.block.round,
        created_timestamp: ctx.now(),
    };
    ctx.put(&keys::challenge_key(&id), &challenge)?;

    let mut open = allocation_challenges(ctx, &allocation_id)?;
    open.open_challenges.push(OpenChallenge {
        challenge_id: id.clone(),
        blobber_id: blobber_id.clone(),
        round_created_at: ctx.block.round,
    });
    ctx.put(&keys::allocation_challenges_key(&allocation_id), &open)?;

    alloc.stats.open_challenges += 1;
    alloc.stats.total_challenges += 1;
    if let Some(ba) = alloc.blobber_alloc_mut(&blobber_id) {
        ba.stats.open_challenges += 1;
        ba.stats.total_challenges += 1;
    }
    allocation::save(ctx, &alloc)?;

    ctx.emit(Event::ChallengeCreated {
        challenge_id: id.clone(),
        blobber_id,
    });
    Ok(Some(id))
}

// --- verification -----------------------------------------------------

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct ValidationTicket {
    pub challenge_id: String,
    pub blobber_id: ProviderId,
    pub validator_id: ProviderId,
    /// `true` is a pass verdict.
    pub result: bool,
    /// Hex ECDSA signature by the validator over
    /// [`ValidationTicket::signing_payload`].
    pub signature: String,
}

impl ValidationTicket {
    pub fn signing_payload(&self) -> Vec<u8> {
        (
            &self.challenge_id,
            &self.blobber_id,
            &self.validator_id,
            self.result,
        )
            .encode()
    }
}

#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct ChallengeResponse {
    pub challenge_id: String,
    pub validation_tickets: Vec<ValidationTicket>,
}

enum Outcome {
    Passed,
    Failed,
    Expired,
}

/// `challenge_response` — the challenged blobber submits the tickets.
pub fn do_challenge_response(ctx: &mut Context, response: ChallengeResponse) -> Result<(), Error> {
    let config = ctx.config()?;
    let challenge: StorageChallenge = ctx.require(
        &keys::challenge_key(&response.challenge_id),
        &format!("challenge {}", response.challenge_id),
    )?;
    if ctx.txn.client_id != challenge.blobber_id {
        return Err(Error::Auth(
            "only the challenged blobber can respond".into(),
        ));
    }
    let mut alloc = allocation::get_active(ctx, &challenge.allocation_id)?;

    // Vet every ticket before counting any.
    let mut seen: Vec<&str> = Vec::new();
    let mut pass_count = 0usize;
    for ticket in &response.validation_tickets {
        if ticket.challenge_id != challenge.id || ticket.blobber_id != challenge.blobber_id {
            return Err(Error::InvalidInput(
                "ticket does not match the challenge".into(),
            ));
        }
        if !challenge.validator_ids.contains(&ticket.validator_id) {
            return Err(Error::InvalidInput(format!(
                "validator {} was not assigned to the challenge",
                ticket.validator_id
            )));
        }
        if seen.contains(&ticket.validator_id.as_str()) {
            return Err(Error::InvalidInput(format!(
                "duplicate ticket from validator {}",
                ticket.validator_id
            )));
        }
        seen.push(&ticket.validator_id);
        let node = validator::get(ctx, &ticket.validator_id)?;
        crypto::verify_signature(&node.public_key, &ticket.signing_payload(), &ticket.signature)?;
        if ticket.result {
            pass_count += 1;
        }
    }

    let late = ctx
        .block
        .round
        .saturating_sub(challenge.created_round)
        > config.max_challenge_completion_rounds;
    let outcome = if late {
        Outcome::Expired
    } else if strict_majority(pass_count, challenge.validator_ids.len()) {
        Outcome::Passed
    } else {
        Outcome::Failed
    };

    settle_challenge(ctx, &challenge, &mut alloc, outcome)?;

    // Drop the challenge from the open set and from state.
    let mut open = allocation_challenges(ctx, &challenge.allocation_id)?;
    open.open_challenges
        .retain(|oc| oc.challenge_id != challenge.id);
    ctx.put(&keys::allocation_challenges_key(&challenge.allocation_id), &open)?;
    ctx.delete(&keys::challenge_key(&challenge.id))?;
    allocation::save(ctx, &alloc)?;
    Ok(())
}

/// Interval accounting at close: forfeit the already-finalized gap, pay
/// the interval up to now, split off the validator share, slash on a hard
/// fail.
fn settle_challenge(
    ctx: &mut Context,
    challenge: &StorageChallenge,
    alloc: &mut StorageAllocation,
    outcome: Outcome,
) -> Result<(), Error> {
    let config = ctx.config()?;
    let now = ctx.now().min(alloc.expiration);
    let expiration = alloc.expiration;
    let blobber_id = challenge.blobber_id.clone();

    let (cpiv, latest_successful, latest_finalized) = {
        let ba = alloc
            .blobber_alloc(&blobber_id)
            .ok_or_else(|| Error::NotFound(format!("blobber {blobber_id} in allocation")))?;
        (
            ba.challenge_pool_integral_value,
            ba.latest_successful_chall_created_at,
            ba.latest_finalized_chall_created_at,
        )
    };
    let mut pool = challenge_pool::get(ctx, &alloc.id)?;

    // Interval already finalized without a success: forfeited, returned to
    // the write pool.
    let move_back = if expiration > latest_successful {
        cpiv.mul_div(
            latest_finalized.saturating_sub(latest_successful),
            expiration - latest_successful,
        )
        .ok_or_else(|| Error::overflow("challenge interval"))?
    } else {
        cpiv
    };
    let remaining_cpiv = cpiv.saturating_sub(move_back);
    pool.balance = pool.balance.saturating_sub(move_back);
    alloc.write_pool = alloc
        .write_pool
        .checked_add(move_back)
        .ok_or_else(|| Error::overflow("write pool"))?;

    // Interval up to now, at stake for this challenge.
    let move_now = if expiration > latest_finalized && now > latest_finalized {
        remaining_cpiv
            .mul_div(now - latest_finalized, expiration - latest_finalized)
            .ok_or_else(|| Error::overflow("challenge interval"))?
    } else {
        Coin::ZERO
    };
    pool.balance = pool.balance.saturating_sub(move_now);
    challenge_pool::save(ctx, &alloc.id, &pool)?;

    let validators_share = move_now.portion(config.validator_reward);
    pay_validators(ctx, &challenge.validator_ids, validators_share)?;
    let blobber_share = move_now.saturating_sub(validators_share);

    let passed = matches!(outcome, Outcome::Passed);
    match outcome {
        Outcome::Passed => {
            let mut sp = stake_pool::get(ctx, ProviderType::Blobber, &blobber_id)?;
            sp.distribute_reward(blobber_share)?;
            stake_pool::save(ctx, ProviderType::Blobber, &blobber_id, &sp)?;
            ctx.emit(Event::Reward {
                provider_id: blobber_id.clone(),
                amount: blobber_share,
            });

            let ba = alloc
                .blobber_alloc_mut(&blobber_id)
                .ok_or_else(|| Error::Internal("blobber allocation vanished".into()))?;
            ba.spent = ba.spent.saturating_add(blobber_share);
            ba.challenge_pool_integral_value =
                remaining_cpiv.saturating_sub(move_now);
            ba.latest_successful_chall_created_at = now;
            ba.latest_finalized_chall_created_at = now;
            ba.stats.success_challenges += 1;
            ba.stats.open_challenges = ba.stats.open_challenges.saturating_sub(1);
            alloc.stats.success_challenges += 1;
        }
        Outcome::Failed => {
            // The blobber's share of the move returns to the client; the
            // blobber is additionally slashed by its risk fraction.
            alloc.write_pool = alloc
                .write_pool
                .checked_add(blobber_share)
                .ok_or_else(|| Error::overflow("write pool"))?;

            let mut sp = stake_pool::get(ctx, ProviderType::Blobber, &blobber_id)?;
            let risk = blobber_share.portion(config.blobber_slash);
            let cap = sp.offer(&alloc.id).map(|o| o.lock).unwrap_or(Coin::ZERO);
            let taken = sp.slash(risk.min(cap));
            stake_pool::save(ctx, ProviderType::Blobber, &blobber_id, &sp)?;
            alloc.write_pool = alloc
                .write_pool
                .checked_add(taken)
                .ok_or_else(|| Error::overflow("write pool"))?;
            if !taken.is_zero() {
                log::warn!(target: "challenge", "blobber {blobber_id} slashed {taken} on challenge {}", challenge.id);
            }

            let ba = alloc
                .blobber_alloc_mut(&blobber_id)
                .ok_or_else(|| Error::Internal("blobber allocation vanished".into()))?;
            ba.challenge_pool_integral_value =
                remaining_cpiv.saturating_sub(move_now);
            ba.latest_finalized_chall_created_at = now;
            ba.stats.failed_challenges += 1;
            ba.stats.open_challenges = ba.stats.open_challenges.saturating_sub(1);
            alloc.stats.failed_challenges += 1;
        }
        Outcome::Expired => {
            // Validators were paid for showing up; the blobber gets
            // nothing but is not slashed either.
            alloc.write_pool = alloc
                .write_pool
                .checked_add(blobber_share)
                .ok_or_else(|| Error::overflow("write pool"))?;

            let ba = alloc
                .blobber_alloc_mut(&blobber_id)
                .ok_or_else(|| Error::Internal("blobber allocation vanished".into()))?;
            ba.challenge_pool_integral_value =
                remaining_cpiv.saturating_sub(move_now);
            ba.latest_finalized_chall_created_at = now;
            ba.stats.failed_challenges += 1;
            ba.stats.open_challenges = ba.stats.open_challenges.saturating_sub(1);
            alloc.stats.failed_challenges += 1;
        }
    }
    alloc.stats.open_challenges = alloc.stats.open_challenges.saturating_sub(1);
    alloc.stats.latest_closed_challenge_txn = ctx.txn.hash.clone();

    ctx.emit(Event::ChallengeResponded {
        challenge_id: challenge.id.clone(),
        passed,
    });
    Ok(())
}

/// Splits `amount` across the challenge's validators proportional to their
/// delegate stake, equally when none is staked. Each share lands in the
/// validator's stake pool through the usual service-charge split.
fn pay_validators(
    ctx: &mut Context,
    validator_ids: &[ProviderId],
    amount: Coin,
) -> Result<(), Error> {
    if amount.is_zero() || validator_ids.is_empty() {
        return Ok(());
    }
    let mut stakes = Vec::with_capacity(validator_ids.len());
    let mut total = Coin::ZERO;
    for id in validator_ids {
        let stake = stake_pool::get(ctx, ProviderType::Validator, id)?.stake();
        total = total.saturating_add(stake);
        stakes.push(stake);
    }

    let mut paid = Coin::ZERO;
    for (index, id) in validator_ids.iter().enumerate() {
        let share = if total.is_zero() {
            amount
                .mul_div(1, validator_ids.len() as u64)
                .unwrap_or(Coin::ZERO)
        } else {
            amount
                .mul_div(stakes[index].as_u64(), total.as_u64())
                .unwrap_or(Coin::ZERO)
        };
        if share.is_zero() {
            continue;
        }
        let mut sp = stake_pool::get(ctx, ProviderType::Validator, id)?;
        sp.distribute_reward(share)?;
        stake_pool::save(ctx, ProviderType::Validator, id, &sp)?;
        paid = paid.saturating_add(share);
        ctx.emit(Event::Reward {
            provider_id: id.clone(),
            amount: share,
        });
    }
    // Truncation leftover goes to the first validator.
    let leftover = amount.saturating_sub(paid);
    if !leftover.is_zero() {
        let id = &validator_ids[0];
        let mut sp = stake_pool::get(ctx, ProviderType::Validator, id)?;
        sp.distribute_reward(leftover)?;
        stake_pool::save(ctx, ProviderType::Validator, id, &sp)?;
    }
    Ok(())
}

// --- settlement support -----------------------------------------------

/// Closes every still-open challenge of an allocation at termination:
/// expired ones count as failed, in-flight ones get the benefit of the
/// doubt and count as successes. No tokens move here; the pass rates feed
/// the settlement weights.
pub fn close_open_challenges(ctx: &mut Context, alloc: &mut StorageAllocation) -> Result<(), Error> {
    let config = ctx.config()?;
    let open = allocation_challenges(ctx, &alloc.id)?;
    for oc in &open.open_challenges {
        let expired = oc.is_expired(ctx.block.round, config.max_challenge_completion_rounds);
        if let Some(ba) = alloc.blobber_alloc_mut(&oc.blobber_id) {
            if expired {
                ba.stats.failed_challenges += 1;
            } else {
                ba.stats.success_challenges += 1;
            }
            ba.stats.open_challenges = ba.stats.open_challenges.saturating_sub(1);
        }
        if expired {
            alloc.stats.failed_challenges += 1;
        } else {
            alloc.stats.success_challenges += 1;
        }
        alloc.stats.open_challenges = alloc.stats.open_challenges.saturating_sub(1);
        ctx.delete(&keys::challenge_key(&oc.challenge_id))?;
    }
    ctx.delete(&keys::allocation_challenges_key(&alloc.id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_majority_ties_fail() {
        // Four validators: three is a majority, two is a tie.
        assert!(strict_majority(3, 4));
        assert!(!strict_majority(2, 4));
        assert!(strict_majority(2, 3));
        assert!(!strict_majority(1, 3));
        assert!(!strict_majority(0, 0));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let oc = OpenChallenge {
            challenge_id: "c".into(),
            blobber_id: "b".into(),
            round_created_at: 100,
        };
        // On-time at exactly created + max rounds, expired one past it.
        assert!(!oc.is_expired(130, 30));
        assert!(oc.is_expired(131, 30));
    }

    #[test]
    fn ticket_payload_binds_the_verdict() {
        let mut ticket = ValidationTicket {
            challenge_id: "c".into(),
            blobber_id: "b".into(),
            validator_id: "v".into(),
            result: true,
            signature: String::new(),
        };
        let payload = ticket.signing_payload();
        ticket.result = false;
        assert_ne!(payload, ticket.signing_payload());
    }
}
