//! State access for the storage market contract.
//!
//! The contract never talks to the chain's trie directly. It sees a
//! [`StateStore`]: an object-safe keyed byte store the host provides. Every
//! transaction runs against an [`OverlayStore`] layered on the host store,
//! which buffers writes and deletes in memory; on success the overlay is
//! committed in one pass, on failure it is dropped and the base store is
//! untouched. This is what makes handler failures atomic.
//!
//! [`MemStore`] is the in-memory implementation used by every test.

use std::collections::BTreeMap;

use smp_partitions::{PartitionStore, PartitionsError};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StateError {
    #[error("state store: {0}")]
    Backend(String),
}

impl From<StateError> for PartitionsError {
    fn from(e: StateError) -> Self {
        PartitionsError::Store(e.to_string())
    }
}

/// Object-safe keyed byte store.
///
/// Raw-bytes only so that `&mut dyn StateStore` can cross the dispatcher
/// boundary; typed encode/decode lives with the caller.
pub trait StateStore {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError>;
    fn put_raw(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StateError>;
    fn delete_raw(&mut self, key: &[u8]) -> Result<(), StateError>;
}

/// In-memory state store.
#[derive(Clone, Debug, Default)]
pub struct MemStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl StateStore for MemStore {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.map.get(key).cloned())
    }

    fn put_raw(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StateError> {
        self.map.insert(key.to_vec(), value);
        Ok(())
    }

    fn delete_raw(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.map.remove(key);
        Ok(())
    }
}

/// A buffered write layer over a base store.
///
/// Reads consult the buffer first, then the base. Nothing reaches the base
/// until [`OverlayStore::commit`]; dropping the overlay discards its
/// changes.
pub struct OverlayStore<'a> {
    base: &'a mut dyn StateStore,
    // None marks a buffered delete.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> OverlayStore<'a> {
    pub fn new(base: &'a mut dyn StateStore) -> Self {
        OverlayStore {
            base,
            writes: BTreeMap::new(),
        }
    }

    /// Number of buffered writes and deletes.
    pub fn pending(&self) -> usize {
        self.writes.len()
    }

    /// Flushes all buffered changes into the base store.
    pub fn commit(self) -> Result<(), StateError> {
        let count = self.writes.len();
        for (key, value) in self.writes {
            match value {
                Some(value) => self.base.put_raw(&key, value)?,
                None => self.base.delete_raw(&key)?,
            }
        }
        log::trace!(target: "state", "overlay committed, {count} keys");
        Ok(())
    }
}

impl StateStore for OverlayStore<'_> {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        match self.writes.get(key) {
            Some(buffered) => Ok(buffered.clone()),
            None => self.base.get_raw(key),
        }
    }

    fn put_raw(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StateError> {
        self.writes.insert(key.to_vec(), Some(value));
        Ok(())
    }

    fn delete_raw(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }
}

// Partitions persist through the same stores.

impl PartitionStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PartitionsError> {
        Ok(self.get_raw(key)?)
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), PartitionsError> {
        Ok(self.put_raw(key, value)?)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), PartitionsError> {
        Ok(self.delete_raw(key)?)
    }
}

impl PartitionStore for OverlayStore<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PartitionsError> {
        Ok(self.get_raw(key)?)
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), PartitionsError> {
        Ok(self.put_raw(key, value)?)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), PartitionsError> {
        Ok(self.delete_raw(key)?)
    }
}
