//! Per-client read pools.
//!
//! A read pool is the client's prepaid balance for read markers across all
//! allocations. Unlike the write pool it is not tied to an allocation and
//! can be reclaimed at any time.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use smp_types::{ClientId, Coin};

use crate::context::Context;
use crate::error::Error;
use crate::keys;

#[derive(Encode, Decode, TypeInfo, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadPool {
    pub balance: Coin,
}

pub fn get(ctx: &Context, client_id: &ClientId) -> Result<ReadPool, Error> {
    Ok(ctx.get(&keys::read_pool_key(client_id))?.unwrap_or_default())
}

pub fn save(ctx: &mut Context, client_id: &ClientId, pool: &ReadPool) -> Result<(), Error> {
    ctx.put(&keys::read_pool_key(client_id), pool)
}

/// `read_pool_lock` — the caller tops up its read pool with `tx.value`.
pub fn do_read_pool_lock(ctx: &mut Context) -> Result<(), Error> {
    let config = ctx.config()?;
    let amount = ctx.txn.value;
    if amount < config.read_pool.min_lock {
        return Err(Error::ConstraintViolation(format!(
            "lock amount {amount} is below read pool min_lock {}",
            config.read_pool.min_lock
        )));
    }
    let client = ctx.txn.client_id.clone();
    let mut pool = get(ctx, &client)?;
    pool.balance = pool
        .balance
        .checked_add(amount)
        .ok_or_else(|| Error::overflow("read pool balance"))?;
    save(ctx, &client, &pool)?;
    ctx.transfer(&client, keys::ADDRESS, amount);
    log::debug!(target: "read_pool", "{client} locked {amount}");
    Ok(())
}

/// `read_pool_unlock` — the caller reclaims its whole read pool.
pub fn do_read_pool_unlock(ctx: &mut Context) -> Result<Coin, Error> {
    let client = ctx.txn.client_id.clone();
    let pool = get(ctx, &client)?;
    if pool.balance.is_zero() {
        return Err(Error::NotFound(format!("read pool of {client} is empty")));
    }
    let amount = pool.balance;
    ctx.delete(&keys::read_pool_key(&client))?;
    ctx.transfer(keys::ADDRESS, &client, amount);
    log::debug!(target: "read_pool", "{client} unlocked {amount}");
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing as ctx_testing;
    use smc_state_store::MemStore;

    #[test]
    fn lock_accumulates_and_unlock_drains() {
        let mut base = MemStore::new();
        {
            let txn = ctx_testing::txn("reader", "tx1", 100, 10);
            let mut ctx = ctx_testing::context(&mut base, txn, 1);
            do_read_pool_lock(&mut ctx).unwrap();
            ctx.commit().unwrap();
        }
        {
            let txn = ctx_testing::txn("reader", "tx2", 40, 11);
            let mut ctx = ctx_testing::context(&mut base, txn, 2);
            do_read_pool_lock(&mut ctx).unwrap();
            assert_eq!(get(&ctx, &"reader".to_string()).unwrap().balance, Coin::new(140));
            ctx.commit().unwrap();
        }
        let txn = ctx_testing::txn("reader", "tx3", 0, 12);
        let mut ctx = ctx_testing::context(&mut base, txn, 3);
        assert_eq!(do_read_pool_unlock(&mut ctx).unwrap(), Coin::new(140));
        let err = do_read_pool_unlock(&mut ctx).unwrap_err();
        assert!(err.to_string().starts_with("not_found"));
    }

    #[test]
    fn lock_below_minimum_is_rejected() {
        let mut base = MemStore::new();
        let txn = ctx_testing::txn("reader", "tx1", 1, 10);
        let mut ctx = ctx_testing::context(&mut base, txn, 1);
        let err = do_read_pool_lock(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("min_lock"));
    }
}
