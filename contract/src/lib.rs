//! Storage smart contract core.
//!
//! Clients rent erasure-coded storage from registered blobbers. An
//! allocation stripes `data + parity` shards across its blobbers and
//! carries the escrow for it: a write pool funded by the client, a
//! challenge pool holding tokens earned but not yet proven, and per-blobber
//! stake pools backing the service with slashable collateral. Random
//! challenges audit the blobbers; passed challenges move tokens from the
//! challenge pool into blobber stake pools, failed ones slash.
//!
//! State lives in a keyed trie behind [`smc_state_store::StateStore`];
//! every record is SCALE-encoded under a sha256-derived key. Transactions
//! enter through [`dispatcher::execute`], which routes by function name and
//! commits the write overlay only on success.

pub mod allocation;
pub mod blobber;
pub mod challenge;
pub mod challenge_pool;
pub mod config;
pub mod context;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod free_storage;
pub mod keys;
pub mod provider;
pub mod read_marker;
pub mod read_pool;
pub mod stake_pool;
pub mod validator;
pub mod write_marker;

#[cfg(test)]
mod scenarios;

pub use config::Config;
pub use context::{BlockInfo, Context, Transaction};
pub use dispatcher::{execute, TxReceipt};
pub use error::Error;
pub use events::{Event, Mint, Transfer};
