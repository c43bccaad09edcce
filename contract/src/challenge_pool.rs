//! Per-allocation challenge pools.
//!
//! The challenge pool holds tokens in transit between an allocation's write
//! pool and the blobbers' stake pools. Write markers fill it, passed
//! challenges and settlement drain it. It is created with the allocation
//! and deleted when the allocation terminates.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use smp_types::{AllocationId, Coin};

use crate::context::Context;
use crate::error::Error;
use crate::keys;

#[derive(Encode, Decode, TypeInfo, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChallengePool {
    pub balance: Coin,
}

pub fn create(ctx: &mut Context, allocation_id: &AllocationId) -> Result<(), Error> {
    let key = keys::challenge_pool_key(allocation_id);
    if ctx.get::<ChallengePool>(&key)?.is_some() {
        return Err(Error::AlreadyExists(format!(
            "challenge pool of allocation {allocation_id}"
        )));
    }
    ctx.put(&key, &ChallengePool::default())
}

pub fn get(ctx: &Context, allocation_id: &AllocationId) -> Result<ChallengePool, Error> {
    ctx.require(
        &keys::challenge_pool_key(allocation_id),
        &format!("challenge pool of allocation {allocation_id}"),
    )
}

pub fn save(
    ctx: &mut Context,
    allocation_id: &AllocationId,
    pool: &ChallengePool,
) -> Result<(), Error> {
    ctx.put(&keys::challenge_pool_key(allocation_id), pool)
}

pub fn delete(ctx: &mut Context, allocation_id: &AllocationId) -> Result<(), Error> {
    ctx.delete(&keys::challenge_pool_key(allocation_id))
}
