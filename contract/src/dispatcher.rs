//! Transaction entry point.
//!
//! [`execute`] routes a transaction by function name through a static
//! handler table, runs the handler against a write overlay, and commits
//! the overlay only on success. A failed handler leaves state untouched
//! and queues no transfers, mints or events.

use codec::{Decode, Encode};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

use smc_state_store::StateStore;

use crate::allocation;
use crate::blobber;
use crate::challenge;
use crate::config;
use crate::context::{BlockInfo, Context, Transaction};
use crate::error::Error;
use crate::events::{Event, Mint, Transfer};
use crate::free_storage;
use crate::read_marker;
use crate::read_pool;
use crate::stake_pool;
use crate::validator;
use crate::write_marker;

type Handler = for<'a, 'b> fn(&'b mut Context<'a>, &[u8]) -> Result<Vec<u8>, Error>;

/// Decodes the handler input, runs it, SCALE-encodes the response.
fn run<'a, I, O>(
    ctx: &mut Context<'a>,
    input: &[u8],
    f: fn(&mut Context<'a>, I) -> Result<O, Error>,
) -> Result<Vec<u8>, Error>
where
    I: Decode,
    O: Encode,
{
    let request = I::decode(&mut &input[..])
        .map_err(|e| Error::InvalidInput(format!("input decoding failed: {e}")))?;
    Ok(f(ctx, request)?.encode())
}

static HANDLERS: Lazy<BTreeMap<&'static str, Handler>> = Lazy::new(|| {
    let mut table: BTreeMap<&'static str, Handler> = BTreeMap::new();
    table.insert("new_allocation_request", |ctx, input| {
        run(ctx, input, allocation::do_new_allocation_request)
    });
    table.insert("update_allocation_request", |ctx, input| {
        run(ctx, input, allocation::do_update_allocation_request)
    });
    table.insert("cancel_allocation_request", |ctx, input| {
        run(ctx, input, allocation::do_cancel_allocation_request)
    });
    table.insert("finalize_allocation", |ctx, input| {
        run(ctx, input, allocation::do_finalize_allocation)
    });
    table.insert("free_allocation_request", |ctx, input| {
        run(ctx, input, free_storage::do_free_allocation_request)
    });
    table.insert("free_update_allocation", |ctx, input| {
        run(ctx, input, free_storage::do_free_update_allocation)
    });
    table.insert("commit_connection", |ctx, input| {
        run(ctx, input, write_marker::do_commit_connection)
    });
    table.insert("read_redeem", |ctx, input| {
        run(ctx, input, read_marker::do_read_redeem)
    });
    table.insert("add_blobber", |ctx, input| {
        run(ctx, input, blobber::do_add_blobber)
    });
    table.insert("update_blobber_settings", |ctx, input| {
        run(ctx, input, blobber::do_update_blobber_settings)
    });
    table.insert("blobber_health_check", |ctx, _input| {
        Ok(blobber::do_blobber_health_check(ctx)?.encode())
    });
    table.insert("shutdown_blobber", |ctx, input| {
        run(ctx, input, blobber::do_shutdown_blobber)
    });
    table.insert("kill_blobber", |ctx, input| {
        run(ctx, input, blobber::do_kill_blobber)
    });
    table.insert("add_validator", |ctx, input| {
        run(ctx, input, validator::do_add_validator)
    });
    table.insert("update_validator_settings", |ctx, input| {
        run(ctx, input, validator::do_update_validator_settings)
    });
    table.insert("validator_health_check", |ctx, _input| {
        Ok(validator::do_validator_health_check(ctx)?.encode())
    });
    table.insert("shutdown_validator", |ctx, input| {
        run(ctx, input, validator::do_shutdown_validator)
    });
    table.insert("kill_validator", |ctx, input| {
        run(ctx, input, validator::do_kill_validator)
    });
    table.insert("challenge_request", |ctx, input| {
        run(ctx, input, challenge::do_challenge_request)
    });
    table.insert("challenge_response", |ctx, input| {
        run(ctx, input, challenge::do_challenge_response)
    });
    table.insert("generate_challenges", |ctx, _input| {
        Ok(challenge::do_generate_challenges(ctx)?.encode())
    });
    table.insert("read_pool_lock", |ctx, _input| {
        Ok(read_pool::do_read_pool_lock(ctx)?.encode())
    });
    table.insert("read_pool_unlock", |ctx, _input| {
        Ok(read_pool::do_read_pool_unlock(ctx)?.encode())
    });
    table.insert("write_pool_lock", |ctx, input| {
        run(ctx, input, allocation::do_write_pool_lock)
    });
    table.insert("write_pool_unlock", |ctx, input| {
        run(ctx, input, allocation::do_write_pool_unlock)
    });
    table.insert("stake_pool_lock", |ctx, input| {
        run(ctx, input, stake_pool::do_stake_pool_lock)
    });
    table.insert("stake_pool_unlock", |ctx, input| {
        run(ctx, input, stake_pool::do_stake_pool_unlock)
    });
    table.insert("collect_reward", |ctx, input| {
        run(ctx, input, stake_pool::do_collect_reward)
    });
    table.insert("add_free_storage_assigner", |ctx, input| {
        run(ctx, input, free_storage::do_add_free_storage_assigner)
    });
    table.insert("add_curator", |ctx, input| {
        run(ctx, input, allocation::do_add_curator)
    });
    table.insert("remove_curator", |ctx, input| {
        run(ctx, input, allocation::do_remove_curator)
    });
    table.insert("curator_transfer_allocation", |ctx, input| {
        run(ctx, input, allocation::do_curator_transfer_allocation)
    });
    table.insert("update_config", |ctx, input| {
        run(ctx, input, config::do_update_config)
    });
    table
});

/// Everything a successful transaction produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    /// SCALE-encoded handler response.
    pub response: Vec<u8>,
    pub events: Vec<Event>,
    pub transfers: Vec<Transfer>,
    pub mints: Vec<Mint>,
}

/// Runs one transaction against `store`. State changes are buffered in an
/// overlay and reach `store` only when the handler succeeds.
pub fn execute(
    store: &mut dyn StateStore,
    txn: Transaction,
    block: BlockInfo,
    function_name: &str,
    input: &[u8],
) -> Result<TxReceipt, Error> {
    let handler = HANDLERS
        .get(function_name)
        .ok_or_else(|| Error::UnknownFunction(function_name.to_string()))?;
    let txn_hash = txn.hash.clone();
    let mut ctx = Context::new(store, txn, block);
    let response = handler(&mut ctx, input).inspect_err(|e| {
        log::debug!(target: "dispatcher", "{function_name} ({txn_hash}): {e}");
    })?;
    let (events, transfers, mints) = ctx.commit()?;
    Ok(TxReceipt {
        response,
        events,
        transfers,
        mints,
    })
}
