//! Shared provider semantics.
//!
//! Blobbers and validators are both providers: they carry a status, a
//! health-check timestamp and a stake pool. The per-kind records live in
//! their own modules; this one holds what they share.

use codec::{Decode, Encode};
use scale_info::TypeInfo;

use smp_types::{ProviderId, Timestamp};

use crate::context::Context;
use crate::error::Error;

/// `Active → {ShutDown, Killed}`. `ShutDown` refuses new allocations but
/// serves existing ones; `Killed` refuses everything.
#[derive(Encode, Decode, TypeInfo, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProviderStatus {
    #[default]
    Active,
    ShutDown,
    Killed,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Active => "active",
            ProviderStatus::ShutDown => "shut down",
            ProviderStatus::Killed => "killed",
        }
    }
}

/// Input of the shutdown/kill/health-check operations.
#[derive(Encode, Decode, TypeInfo, Clone, Debug)]
pub struct ProviderRequest {
    pub provider_id: ProviderId,
}

pub fn is_healthy(last_health_check: Timestamp, now: Timestamp, period: Timestamp) -> bool {
    now.saturating_sub(last_health_check) <= period
}

/// Shutdown and kill authorization: the provider's delegate wallet may shut
/// down; only the config owner may kill; the owner may also shut down.
pub fn authorize_retirement(
    ctx: &Context,
    delegate_wallet: &str,
    kill: bool,
) -> Result<(), Error> {
    let owner = ctx.config()?.owner_id;
    let caller = &ctx.txn.client_id;
    if kill {
        if *caller != owner {
            return Err(Error::Auth("only the owner can kill a provider".into()));
        }
        return Ok(());
    }
    if *caller != owner && caller != delegate_wallet {
        return Err(Error::Auth(
            "only the delegate wallet or the owner can shut down a provider".into(),
        ));
    }
    Ok(())
}
