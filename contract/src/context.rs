//! Per-transaction execution context.
//!
//! A [`Context`] bundles the transaction, the current block, and an
//! [`OverlayStore`] over the host state, plus the buffered side effects
//! (events, transfers, mints). Handlers mutate only the context; the
//! dispatcher commits the overlay and releases the buffers on success, or
//! drops everything on error. That makes every handler atomic without any
//! handler-side cleanup.

use codec::{Decode, Encode};

use smc_state_store::{OverlayStore, StateStore};
use smp_types::{ClientId, Coin, Round, Timestamp, TxHash};

use crate::config::Config;
use crate::error::Error;
use crate::events::{Event, Mint, Transfer};
use crate::keys;

/// The slice of a host transaction the contract consumes.
#[derive(Clone, Debug)]
pub struct Transaction {
    pub hash: TxHash,
    pub client_id: ClientId,
    /// Tokens sent along with the call, already debited from the caller.
    pub value: Coin,
    pub creation_date: Timestamp,
}

/// The block the transaction executes in. `hash` seeds all randomness.
#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub round: Round,
    pub hash: String,
}

pub struct Context<'a> {
    store: OverlayStore<'a>,
    pub txn: Transaction,
    pub block: BlockInfo,
    events: Vec<Event>,
    transfers: Vec<Transfer>,
    mints: Vec<Mint>,
}

impl<'a> Context<'a> {
    pub fn new(base: &'a mut dyn StateStore, txn: Transaction, block: BlockInfo) -> Self {
        Context {
            store: OverlayStore::new(base),
            txn,
            block,
            events: Vec::new(),
            transfers: Vec::new(),
            mints: Vec::new(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.txn.creation_date
    }

    /// The overlay, for partition operations that take a raw store.
    pub fn store(&self) -> &OverlayStore<'a> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut OverlayStore<'a> {
        &mut self.store
    }

    pub fn get<T: Decode>(&self, key: &[u8]) -> Result<Option<T>, Error> {
        match self.store.get_raw(key)? {
            Some(bytes) => Ok(Some(T::decode(&mut &bytes[..]).map_err(|e| {
                Error::Internal(format!("state decoding failed: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Like [`Context::get`] but absence is a `not_found` error naming the
    /// missing entity.
    pub fn require<T: Decode>(&self, key: &[u8], what: &str) -> Result<T, Error> {
        self.get(key)?
            .ok_or_else(|| Error::NotFound(what.to_string()))
    }

    pub fn put<T: Encode>(&mut self, key: &[u8], value: &T) -> Result<(), Error> {
        self.store.put_raw(key, value.encode())?;
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.store.delete_raw(key)?;
        Ok(())
    }

    /// The config singleton. Re-read per operation, never cached across
    /// transactions.
    pub fn config(&self) -> Result<Config, Error> {
        self.require(&keys::config_key(), "config record")
    }

    pub fn put_config(&mut self, config: &Config) -> Result<(), Error> {
        config.validate()?;
        self.put(&keys::config_key(), config)
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn transfer(&mut self, from: &str, to: &str, amount: Coin) {
        if amount.is_zero() {
            return;
        }
        self.transfers.push(Transfer {
            from: from.to_string(),
            to: to.to_string(),
            amount,
        });
    }

    /// Queues a mint and advances `config.minted`, failing when the cap
    /// would be exceeded.
    pub fn mint(&mut self, to: &str, amount: Coin) -> Result<(), Error> {
        let mut config = self.config()?;
        let minted = config
            .minted
            .checked_add(amount)
            .ok_or_else(|| Error::overflow("minted total"))?;
        if minted > config.max_mint {
            return Err(Error::Arith(format!(
                "mint of {amount} would exceed max_mint {}",
                config.max_mint
            )));
        }
        config.minted = minted;
        self.put_config(&config)?;
        self.mints.push(Mint {
            to: to.to_string(),
            amount,
        });
        Ok(())
    }

    /// Commits the overlay and surrenders the buffered side effects.
    pub fn commit(self) -> Result<(Vec<Event>, Vec<Transfer>, Vec<Mint>), Error> {
        self.store.commit()?;
        Ok((self.events, self.transfers, self.mints))
    }

    #[cfg(test)]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[cfg(test)]
    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::config;

    pub fn txn(client_id: &str, hash: &str, value: u64, now: Timestamp) -> Transaction {
        Transaction {
            hash: hash.to_string(),
            client_id: client_id.to_string(),
            value: Coin::new(value),
            creation_date: now,
        }
    }

    pub fn block(round: Round) -> BlockInfo {
        BlockInfo {
            round,
            hash: format!("{round:064x}"),
        }
    }

    /// A context over `base` with the test config already written.
    pub fn context<'a>(
        base: &'a mut dyn StateStore,
        txn: Transaction,
        round: Round,
    ) -> Context<'a> {
        let mut ctx = Context::new(base, txn, block(round));
        ctx.put_config(&config::testing::config()).unwrap();
        ctx
    }
}
