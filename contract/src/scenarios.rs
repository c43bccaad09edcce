//! Cross-module flows: creation, marker accounting, challenge payouts and
//! settlement, driven through the dispatcher where the flow allows it.

use codec::Encode;

use smc_state_store::MemStore;
use smp_types::{Coin, PriceRange, ProviderType, MB};

use crate::allocation::{self, testing as alloc_testing, NewAllocationRequest};
use crate::blobber;
use crate::challenge::{
    self, AllocationChallenges, ChallengeResponse, OpenChallenge, StorageChallenge,
    ValidationTicket,
};
use crate::challenge_pool;
use crate::context::testing as ctx_testing;
use crate::crypto::testing as crypto_testing;
use crate::dispatcher::execute;
use crate::keys;
use crate::stake_pool::{self, DelegatePool};
use crate::validator::{self, testing as validator_testing};
use crate::write_marker::{CommitConnection, WriteMarker};

const GB_PRICE: u64 = 10_000_000_000;

fn seeded_store() -> MemStore {
    let mut base = MemStore::new();
    let txn = ctx_testing::txn("seed", "tx-seed", 0, 1);
    let ctx = ctx_testing::context(&mut base, txn, 1);
    ctx.commit().unwrap();
    base
}

// Eight blobbers "0".."7", capacity 2^29, write price 1e10, staked.
fn eight_blobber_store() -> MemStore {
    let mut base = seeded_store();
    for i in 0..8 {
        alloc_testing::register_staked_blobber(
            &mut base,
            &i.to_string(),
            GB_PRICE,
            1 << 29,
            1_000_000,
        );
    }
    base
}

fn scenario_request(owner: &str, now: u64) -> NewAllocationRequest {
    let ids: Vec<String> = (0..8).map(|i| i.to_string()).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    alloc_testing::request(owner, 1024, 3, 5, now + 3600, &refs)
}

// ceil(1024/3) bytes billed per blobber at 1e10 per GB, truncated.
const BLOBBER_COST: u64 = 3185;

#[test]
fn happy_path_creation_through_the_dispatcher() {
    let mut base = eight_blobber_store();
    let receipt = execute(
        &mut base,
        ctx_testing::txn("client", "tx-alloc", 8 * BLOBBER_COST, 1000),
        ctx_testing::block(1),
        "new_allocation_request",
        &scenario_request("client", 1000).encode(),
    )
    .unwrap();
    let id = String::from("tx-alloc");
    assert_eq!(receipt.response, id.encode());
    assert_eq!(receipt.transfers.len(), 1);
    assert_eq!(receipt.transfers[0].amount, Coin::new(8 * BLOBBER_COST));
    assert_eq!(receipt.transfers[0].to, keys::ADDRESS);

    let txn = ctx_testing::txn("q", "tx-q", 0, 1000);
    let ctx = ctx_testing::context(&mut base, txn, 1);
    let alloc = allocation::get(&ctx, &id).unwrap();
    assert_eq!(alloc.write_pool, Coin::new(8 * BLOBBER_COST));
    assert_eq!(challenge_pool::get(&ctx, &id).unwrap().balance, Coin::ZERO);
    for i in 0..8 {
        let node = blobber::get(&ctx, &i.to_string()).unwrap();
        assert_eq!(node.allocated, 128);
        assert!(node.allocated <= node.capacity);
    }
}

#[test]
fn recreating_under_the_same_hash_is_rejected_and_harmless() {
    let mut base = eight_blobber_store();
    let run = |base: &mut MemStore| {
        execute(
            base,
            ctx_testing::txn("client", "tx-alloc", 8 * BLOBBER_COST, 1000),
            ctx_testing::block(1),
            "new_allocation_request",
            &scenario_request("client", 1000).encode(),
        )
    };
    run(&mut base).unwrap();
    let err = run(&mut base).unwrap_err();
    assert_eq!(err.to_string(), "already_exists: allocation tx-alloc");

    // State as after the first run: capacity booked exactly once.
    let txn = ctx_testing::txn("q", "tx-q", 0, 1000);
    let ctx = ctx_testing::context(&mut base, txn, 1);
    assert_eq!(blobber::get(&ctx, &"0".to_string()).unwrap().allocated, 128);
}

#[test]
fn underfunded_creation_is_constraint_violation() {
    let mut base = eight_blobber_store();
    let err = execute(
        &mut base,
        ctx_testing::txn("client", "tx-alloc", 1, 1000),
        ctx_testing::block(1),
        "new_allocation_request",
        &scenario_request("client", 1000).encode(),
    )
    .unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.starts_with("constraint_violation"));
    assert!(rendered.contains("insufficient funds"));
}

/// One-blobber allocation of 200 MB with a signing owner, ready for
/// markers. Returns the allocation id and the owner's signing key.
fn marker_fixture(base: &mut MemStore) -> (String, k256::ecdsa::SigningKey) {
    alloc_testing::register_staked_blobber(base, "b1", GB_PRICE, 1 << 29, 2_000_000_000);
    let (key, public_hex) = crypto_testing::keypair(5);
    let size = 200 * MB;
    // 200 MB / 1 GB = 0.1953125 exactly.
    let cost = 1_953_125_000u64;
    let txn = ctx_testing::txn("client", "tx-alloc", cost, 1000);
    let mut ctx = ctx_testing::context(base, txn, 1);
    let request = NewAllocationRequest {
        owner: "client".into(),
        owner_public_key: public_hex,
        size,
        data_shards: 1,
        parity_shards: 0,
        expiration: 1000 + 3600,
        read_price_range: PriceRange::new(Coin::ZERO, Coin::new(100_000_000_000)),
        write_price_range: PriceRange::new(Coin::new(1), Coin::new(100_000_000_000)),
        blobbers: vec!["b1".into()],
        third_party_extendable: false,
    };
    let id = allocation::do_new_allocation_request(&mut ctx, request).unwrap();
    ctx.commit().unwrap();
    (id, key)
}

fn commit_marker(
    base: &mut MemStore,
    allocation_id: &str,
    key: &k256::ecdsa::SigningKey,
    tx: &str,
    size: i64,
    prev_root: &str,
    root: &str,
) -> Result<(), crate::Error> {
    let mut marker = WriteMarker {
        client_id: "client".into(),
        client_public_key: String::new(),
        blobber_id: "b1".into(),
        allocation_id: allocation_id.into(),
        owner_id: "client".into(),
        timestamp: 1200,
        size,
        allocation_root: root.into(),
        prev_allocation_root: prev_root.into(),
        signature: String::new(),
    };
    marker.signature = crypto_testing::sign(key, &marker.signing_payload());
    execute(
        base,
        ctx_testing::txn("b1", tx, 0, 1200),
        ctx_testing::block(2),
        "commit_connection",
        &CommitConnection {
            allocation_root: root.into(),
            prev_allocation_root: prev_root.into(),
            write_marker: marker,
        }
        .encode(),
    )
    .map(|_| ())
}

#[test]
fn write_then_delete_moves_tokens_symmetrically() {
    let mut base = seeded_store();
    let (id, key) = marker_fixture(&mut base);
    let initial_pool = Coin::new(1_953_125_000);
    // 100 MB and 50 MB at 1e10 per GB, both exact in integers.
    let hundred = Coin::new(976_562_500);
    let fifty = Coin::new(488_281_250);

    commit_marker(&mut base, &id, &key, "tx-w1", 100 * MB as i64, "", "r1").unwrap();
    {
        let txn = ctx_testing::txn("q", "tx-q1", 0, 1200);
        let ctx = ctx_testing::context(&mut base, txn, 2);
        let alloc = allocation::get(&ctx, &id).unwrap();
        assert_eq!(challenge_pool::get(&ctx, &id).unwrap().balance, hundred);
        assert_eq!(alloc.write_pool, initial_pool.saturating_sub(hundred));
        assert_eq!(alloc.stats.used_size, 100 * MB);
        assert_eq!(blobber::get(&ctx, &"b1".to_string()).unwrap().saved_data, 100 * MB);
    }

    commit_marker(&mut base, &id, &key, "tx-w2", -(50 * MB as i64), "r1", "r2").unwrap();
    {
        let txn = ctx_testing::txn("q", "tx-q2", 0, 1200);
        let ctx = ctx_testing::context(&mut base, txn, 2);
        let alloc = allocation::get(&ctx, &id).unwrap();
        assert_eq!(
            challenge_pool::get(&ctx, &id).unwrap().balance,
            hundred.saturating_sub(fifty)
        );
        assert_eq!(alloc.stats.used_size, 50 * MB);
    }

    // Deleting the rest restores both pools exactly.
    commit_marker(&mut base, &id, &key, "tx-w3", -(50 * MB as i64), "r2", "r3").unwrap();
    let txn = ctx_testing::txn("q", "tx-q3", 0, 1200);
    let ctx = ctx_testing::context(&mut base, txn, 2);
    let alloc = allocation::get(&ctx, &id).unwrap();
    assert_eq!(challenge_pool::get(&ctx, &id).unwrap().balance, Coin::ZERO);
    assert_eq!(alloc.write_pool, initial_pool);
    assert_eq!(alloc.stats.used_size, 0);
}

#[test]
fn marker_must_chain_and_be_signed_by_the_owner() {
    let mut base = seeded_store();
    let (id, key) = marker_fixture(&mut base);

    // Wrong previous root.
    let err = commit_marker(&mut base, &id, &key, "tx-w1", 1024, "bogus", "r1").unwrap_err();
    assert!(err.to_string().starts_with("invalid_state_transition"));

    // Signed by somebody else.
    let (foreign, _) = crypto_testing::keypair(6);
    let err = commit_marker(&mut base, &id, &foreign, "tx-w2", 1024, "", "r1").unwrap_err();
    assert!(err.to_string().starts_with("auth"));
}

/// The literal challenge-distribution fixture: one blobber, integral value
/// 700000, last success at 0, last finalized at 5, expiring at 222,
/// responded at 99.
fn challenge_fixture(base: &mut MemStore) -> (String, k256::ecdsa::SigningKey) {
    alloc_testing::register_staked_blobber(base, "b1", GB_PRICE, 1 << 29, 1_000_000);
    let (validator_key, validator_public) = crypto_testing::keypair(11);
    {
        let txn = ctx_testing::txn("v1", "tx-v1", 0, 1);
        let mut ctx = ctx_testing::context(base, txn, 1);
        let mut node = validator_testing::node("v1");
        node.public_key = validator_public;
        validator::do_add_validator(&mut ctx, node).unwrap();
        ctx.commit().unwrap();
    }

    let txn = ctx_testing::txn("client", "tx-alloc", 9536, 0);
    let mut ctx = ctx_testing::context(base, txn, 1);
    let ids = ["b1"];
    let request = alloc_testing::request("client", 1024, 1, 0, 222, &ids);
    let id = allocation::do_new_allocation_request(&mut ctx, request).unwrap();

    // Shape the literal state.
    let mut alloc = allocation::get(&ctx, &id).unwrap();
    alloc.write_pool = Coin::ZERO;
    {
        let ba = alloc.blobber_alloc_mut("b1").unwrap();
        ba.challenge_pool_integral_value = Coin::new(700_000);
        ba.latest_successful_chall_created_at = 0;
        ba.latest_finalized_chall_created_at = 5;
        ba.stats.open_challenges = 1;
        ba.stats.total_challenges = 1;
    }
    alloc.stats.open_challenges = 1;
    alloc.stats.total_challenges = 1;
    allocation::save(&mut ctx, &alloc).unwrap();

    let mut pool = challenge_pool::get(&ctx, &id).unwrap();
    pool.balance = Coin::new(700_000);
    challenge_pool::save(&mut ctx, &id, &pool).unwrap();

    // Two delegates at a 2:1 stake ratio behind the 30% service charge.
    let mut sp = stake_pool::get(&ctx, ProviderType::Blobber, &"b1".to_string()).unwrap();
    sp.pools.clear();
    sp.pools.insert(
        "d1".into(),
        DelegatePool {
            balance: Coin::new(2_000),
            reward: Coin::ZERO,
        },
    );
    sp.pools.insert(
        "d2".into(),
        DelegatePool {
            balance: Coin::new(1_000),
            reward: Coin::ZERO,
        },
    );
    sp.total_offers = Coin::ZERO;
    stake_pool::save(&mut ctx, ProviderType::Blobber, &"b1".to_string(), &sp).unwrap();

    let challenge = StorageChallenge {
        id: "ch1".into(),
        allocation_id: id.clone(),
        blobber_id: "b1".into(),
        validator_ids: vec!["v1".into()],
        created_round: 1,
        created_timestamp: 10,
    };
    ctx.put(&keys::challenge_key("ch1"), &challenge).unwrap();
    ctx.put(
        &keys::allocation_challenges_key(&id),
        &AllocationChallenges {
            open_challenges: vec![OpenChallenge {
                challenge_id: "ch1".into(),
                blobber_id: "b1".into(),
                round_created_at: 1,
            }],
        },
    )
    .unwrap();
    ctx.commit().unwrap();
    (id, validator_key)
}

fn respond(
    base: &mut MemStore,
    validator_key: &k256::ecdsa::SigningKey,
    verdict: bool,
) -> Result<(), crate::Error> {
    let mut ticket = ValidationTicket {
        challenge_id: "ch1".into(),
        blobber_id: "b1".into(),
        validator_id: "v1".into(),
        result: verdict,
        signature: String::new(),
    };
    ticket.signature = crypto_testing::sign(validator_key, &ticket.signing_payload());
    let txn = ctx_testing::txn("b1", "tx-resp", 0, 99);
    let mut ctx = ctx_testing::context(base, txn, 5);
    challenge::do_challenge_response(
        &mut ctx,
        ChallengeResponse {
            challenge_id: "ch1".into(),
            validation_tickets: vec![ticket],
        },
    )?;
    ctx.commit().unwrap();
    Ok(())
}

#[test]
fn challenge_pass_distributes_interval_rewards() {
    let mut base = seeded_store();
    let (id, validator_key) = challenge_fixture(&mut base);
    respond(&mut base, &validator_key, true).unwrap();

    // move back: 700000 * 5 / 222 = 15765 to the write pool; at stake:
    // 684235 * 94 / 217 = 296396, of which 2.5% = 7409 to the validator
    // and 288987 to the blobber pool.
    let txn = ctx_testing::txn("q", "tx-q", 0, 99);
    let ctx = ctx_testing::context(&mut base, txn, 5);
    let alloc = allocation::get(&ctx, &id).unwrap();
    assert_eq!(alloc.write_pool, Coin::new(15_765));
    assert_eq!(
        challenge_pool::get(&ctx, &id).unwrap().balance,
        Coin::new(700_000 - 15_765 - 296_396)
    );
    let ba = alloc.blobber_alloc("b1").unwrap();
    assert_eq!(ba.challenge_pool_integral_value, Coin::new(387_839));
    assert_eq!(ba.latest_successful_chall_created_at, 99);
    assert_eq!(ba.latest_finalized_chall_created_at, 99);
    assert_eq!(ba.stats.success_challenges, 1);
    assert_eq!(ba.stats.open_challenges, 0);
    assert_eq!(ba.spent, Coin::new(288_987));

    // 30% service charge of 288987 is 86696 to the delegate wallet, the
    // rest splits 2:1 over the delegates; each payout within one unit.
    let sp = stake_pool::get(&ctx, ProviderType::Blobber, &"b1".to_string()).unwrap();
    let wallet = sp.reward.as_u64() as i64;
    let d1 = sp.pools["d1"].reward.as_u64() as i64;
    let d2 = sp.pools["d2"].reward.as_u64() as i64;
    assert!((wallet - 86_696).abs() <= 1, "wallet got {wallet}");
    assert!((d1 - 134_860).abs() <= 1, "d1 got {d1}");
    assert!((d2 - 67_430).abs() <= 1, "d2 got {d2}");
    assert_eq!(wallet + d1 + d2, 288_987);

    let vp = stake_pool::get(&ctx, ProviderType::Validator, &"v1".to_string()).unwrap();
    assert_eq!(vp.reward, Coin::new(7_409));

    // The challenge is gone.
    assert!(ctx
        .get::<StorageChallenge>(&keys::challenge_key("ch1"))
        .unwrap()
        .is_none());
}

#[test]
fn challenge_failure_pays_validators_and_slashes() {
    let mut base = seeded_store();
    let (id, validator_key) = challenge_fixture(&mut base);
    respond(&mut base, &validator_key, false).unwrap();

    let txn = ctx_testing::txn("q", "tx-q", 0, 99);
    let ctx = ctx_testing::context(&mut base, txn, 5);
    let alloc = allocation::get(&ctx, &id).unwrap();
    let ba = alloc.blobber_alloc("b1").unwrap();
    assert_eq!(ba.stats.failed_challenges, 1);
    assert_eq!(ba.latest_finalized_chall_created_at, 99);
    // Success timestamp untouched on failure.
    assert_eq!(ba.latest_successful_chall_created_at, 0);

    // The validator is paid either way.
    let vp = stake_pool::get(&ctx, ProviderType::Validator, &"v1".to_string()).unwrap();
    assert_eq!(vp.reward, Coin::new(7_409));

    // The blobber share returns to the client, topped up by the slash:
    // 10% of 288987 is 28898, capped by the offer lock 9536, but the
    // delegates only hold 3000 to take.
    let sp = stake_pool::get(&ctx, ProviderType::Blobber, &"b1".to_string()).unwrap();
    assert_eq!(sp.stake(), Coin::ZERO);
    assert_eq!(
        alloc.write_pool,
        Coin::new(15_765 + 288_987 + 3_000)
    );
}

#[test]
fn generation_is_deterministic_and_rate_bound() {
    let mut base = seeded_store();
    let (id, key) = marker_fixture(&mut base);
    commit_marker(&mut base, &id, &key, "tx-w1", 100 * MB as i64, "", "r1").unwrap();
    for v in ["v1", "v2"] {
        let txn = ctx_testing::txn(v, &format!("tx-{v}"), 0, 1200);
        let mut ctx = ctx_testing::context(&mut base, txn, 2);
        validator::do_add_validator(&mut ctx, validator_testing::node(v)).unwrap();
        ctx.commit().unwrap();
    }

    let generate = |base: &mut MemStore| {
        let txn = ctx_testing::txn("miner", "tx-gen", 0, 1260);
        let mut ctx = ctx_testing::context(base, txn, 3);
        let created = challenge::do_generate_challenges(&mut ctx).unwrap();
        (created, ctx.commit().unwrap().0)
    };
    let mut fork = base.clone();
    let (created, events) = generate(&mut base);
    // 100 MB of stored data at 1 challenge per MB-minute, capped at 100.
    assert_eq!(created, 100);
    assert_eq!(events.len(), 100);
    // Same block entropy, same challenges.
    let (created_again, events_again) = generate(&mut fork);
    assert_eq!(created, created_again);
    assert_eq!(events, events_again);

    // The same round never generates twice.
    let txn = ctx_testing::txn("miner", "tx-gen2", 0, 1260);
    let mut ctx = ctx_testing::context(&mut base, txn, 3);
    assert_eq!(challenge::do_generate_challenges(&mut ctx).unwrap(), 0);

    let open: AllocationChallenges = ctx
        .get(&keys::allocation_challenges_key(&id))
        .unwrap()
        .unwrap();
    assert_eq!(open.open_challenges.len(), 100);
    // Assigned validators are registered and distinct from the blobber.
    let first = ctx
        .get::<StorageChallenge>(&keys::challenge_key(&open.open_challenges[0].challenge_id))
        .unwrap()
        .unwrap();
    assert_eq!(first.blobber_id, "b1");
    assert_eq!(first.validator_ids.len(), 2);
    assert!(first.validator_ids.contains(&"v1".to_string()));
    assert!(first.validator_ids.contains(&"v2".to_string()));
}

#[test]
fn on_demand_challenge_requires_a_ready_blobber() {
    let mut base = seeded_store();
    alloc_testing::register_staked_blobber(&mut base, "idle", GB_PRICE, 1 << 29, 1_000);
    let txn = ctx_testing::txn("anyone", "tx-cr", 0, 100);
    let mut ctx = ctx_testing::context(&mut base, txn, 2);
    let err = challenge::do_challenge_request(
        &mut ctx,
        crate::provider::ProviderRequest {
            provider_id: "idle".into(),
        },
    )
    .unwrap_err();
    assert!(err.to_string().contains("not challenge ready"));
}
