//! Bucketed item partitions with weight subtotals.
//!
//! A partitions instance is a persistent array of fixed-capacity buckets.
//! The root record holds the bucket count, the per-bucket weight subtotals
//! and the total weight; each bucket holds its items. A weighted pick is
//! two-level: first a bucket by subtotal, then an item within the bucket,
//! so a selection costs `O(buckets + partition_size)` instead of a scan of
//! every item. Membership is tracked through per-item location records so
//! that add is idempotent-checked and remove is `O(1)` via swap-remove
//! with the tail item of the tail bucket.
//!
//! The caller supplies the backing key/value store and the RNG; nothing in
//! here reads a clock or an entropy source, so two replicas driving the
//! same store with the same seeded RNG observe identical picks.

use codec::{Decode, Encode};
use rand::Rng;

/// Minimal keyed byte store the partitions persist through.
///
/// Implemented by the contract's state stores. Keys are opaque bytes
/// derived from the partitions name.
pub trait PartitionStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PartitionsError>;
    fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), PartitionsError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), PartitionsError>;
}

/// An item storable in partitions.
///
/// `name` must be unique within one partitions instance. `weight` drives
/// the two-level pick; uniform sets leave the default of 1. Weights of 0
/// make an item unreachable by `pick` and are the caller's mistake.
pub trait PartitionItem: Encode + Decode + Clone {
    fn name(&self) -> &str;

    fn weight(&self) -> u64 {
        1
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PartitionsError {
    #[error("partitions store: {0}")]
    Store(String),
    #[error("partitions codec: {0}")]
    Codec(String),
    #[error("partitions item not found: {0}")]
    ItemNotFound(String),
    #[error("partitions item already exists: {0}")]
    ItemAlreadyExists(String),
    #[error("partitions are empty")]
    Empty,
}

/// Root record: bucket count, weight subtotals and item total.
#[derive(Encode, Decode, Clone, Debug, Default, PartialEq, Eq)]
struct Root {
    partition_size: u32,
    bucket_weights: Vec<u64>,
    total_weight: u64,
    total_items: u64,
}

#[derive(Encode, Decode, Clone, Debug, Default)]
struct Bucket<T> {
    items: Vec<T>,
}

/// Location of an item, for membership checks and O(1) removal.
#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq)]
struct Location {
    bucket: u32,
}

/// Handle over one persistent partitions instance.
///
/// The root record is loaded on `open` and written back by every mutating
/// call; buckets are loaded lazily.
pub struct Partitions<T> {
    name: Vec<u8>,
    root: Root,
    _marker: core::marker::PhantomData<T>,
}

fn decode<T: Decode>(bytes: &[u8]) -> Result<T, PartitionsError> {
    T::decode(&mut &bytes[..]).map_err(|e| PartitionsError::Codec(e.to_string()))
}

impl<T: PartitionItem> Partitions<T> {
    /// Opens the partitions at `name`, creating an empty root if absent.
    pub fn open(
        store: &dyn PartitionStore,
        name: &[u8],
        partition_size: u32,
    ) -> Result<Self, PartitionsError> {
        debug_assert!(partition_size > 0);
        let root = match store.get(name)? {
            Some(bytes) => decode(&bytes)?,
            None => Root {
                partition_size,
                ..Root::default()
            },
        };
        Ok(Partitions {
            name: name.to_vec(),
            root,
            _marker: core::marker::PhantomData,
        })
    }

    pub fn len(&self) -> u64 {
        self.root.total_items
    }

    pub fn is_empty(&self) -> bool {
        self.root.total_items == 0
    }

    pub fn total_weight(&self) -> u64 {
        self.root.total_weight
    }

    fn bucket_key(&self, index: u32) -> Vec<u8> {
        let mut key = self.name.clone();
        key.extend_from_slice(b":bucket:");
        key.extend_from_slice(&index.to_le_bytes());
        key
    }

    fn location_key(&self, item_name: &str) -> Vec<u8> {
        let mut key = self.name.clone();
        key.extend_from_slice(b":loc:");
        key.extend_from_slice(item_name.as_bytes());
        key
    }

    fn load_bucket(
        &self,
        store: &dyn PartitionStore,
        index: u32,
    ) -> Result<Bucket<T>, PartitionsError> {
        match store.get(&self.bucket_key(index))? {
            Some(bytes) => decode(&bytes),
            None => Ok(Bucket { items: Vec::new() }),
        }
    }

    fn save_bucket(
        &self,
        store: &mut dyn PartitionStore,
        index: u32,
        bucket: &Bucket<T>,
    ) -> Result<(), PartitionsError> {
        store.put(&self.bucket_key(index), bucket.encode())
    }

    fn save_root(&self, store: &mut dyn PartitionStore) -> Result<(), PartitionsError> {
        store.put(&self.name, self.root.encode())
    }

    fn location(
        &self,
        store: &dyn PartitionStore,
        item_name: &str,
    ) -> Result<Option<Location>, PartitionsError> {
        match store.get(&self.location_key(item_name))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(
        &self,
        store: &dyn PartitionStore,
        item_name: &str,
    ) -> Result<bool, PartitionsError> {
        Ok(self.location(store, item_name)?.is_some())
    }

    pub fn get(
        &self,
        store: &dyn PartitionStore,
        item_name: &str,
    ) -> Result<Option<T>, PartitionsError> {
        let Some(loc) = self.location(store, item_name)? else {
            return Ok(None);
        };
        let bucket = self.load_bucket(store, loc.bucket)?;
        Ok(bucket.items.into_iter().find(|i| i.name() == item_name))
    }

    /// Adds a new item to the tail bucket, opening a new bucket when the
    /// tail is full. Fails if an item with the same name is present.
    pub fn add(&mut self, store: &mut dyn PartitionStore, item: &T) -> Result<(), PartitionsError> {
        if self.contains(store, item.name())? {
            return Err(PartitionsError::ItemAlreadyExists(item.name().to_string()));
        }

        let tail = match self.root.bucket_weights.len() {
            0 => 0u32,
            n => (n - 1) as u32,
        };
        let mut bucket = self.load_bucket(store, tail)?;
        let index = if self.root.bucket_weights.is_empty()
            || bucket.items.len() as u32 >= self.root.partition_size
        {
            // Open a fresh tail bucket.
            let index = self.root.bucket_weights.len() as u32;
            self.root.bucket_weights.push(0);
            bucket = Bucket { items: Vec::new() };
            index
        } else {
            tail
        };

        bucket.items.push(item.clone());
        self.root.bucket_weights[index as usize] += item.weight();
        self.root.total_weight += item.weight();
        self.root.total_items += 1;

        self.save_bucket(store, index, &bucket)?;
        store.put(&self.location_key(item.name()), Location { bucket: index }.encode())?;
        self.save_root(store)
    }

    /// Replaces the stored copy of an item, keeping subtotals in sync with
    /// its (possibly changed) weight.
    pub fn update(
        &mut self,
        store: &mut dyn PartitionStore,
        item: &T,
    ) -> Result<(), PartitionsError> {
        let loc = self
            .location(store, item.name())?
            .ok_or_else(|| PartitionsError::ItemNotFound(item.name().to_string()))?;
        let mut bucket = self.load_bucket(store, loc.bucket)?;
        let pos = bucket
            .items
            .iter()
            .position(|i| i.name() == item.name())
            .ok_or_else(|| PartitionsError::ItemNotFound(item.name().to_string()))?;

        let old_weight = bucket.items[pos].weight();
        bucket.items[pos] = item.clone();

        let subtotal = &mut self.root.bucket_weights[loc.bucket as usize];
        *subtotal = *subtotal - old_weight + item.weight();
        self.root.total_weight = self.root.total_weight - old_weight + item.weight();

        self.save_bucket(store, loc.bucket, &bucket)?;
        self.save_root(store)
    }

    /// Removes an item, filling the hole with the tail item of the tail
    /// bucket so that only the tail bucket ever shrinks.
    pub fn remove(
        &mut self,
        store: &mut dyn PartitionStore,
        item_name: &str,
    ) -> Result<(), PartitionsError> {
        let loc = self
            .location(store, item_name)?
            .ok_or_else(|| PartitionsError::ItemNotFound(item_name.to_string()))?;
        let tail = (self.root.bucket_weights.len() - 1) as u32;

        let mut bucket = self.load_bucket(store, loc.bucket)?;
        let pos = bucket
            .items
            .iter()
            .position(|i| i.name() == item_name)
            .ok_or_else(|| PartitionsError::ItemNotFound(item_name.to_string()))?;
        let removed_weight = bucket.items[pos].weight();

        if loc.bucket == tail {
            let item = bucket.items.swap_remove(pos);
            debug_assert_eq!(item.name(), item_name);
        } else {
            let mut tail_bucket = self.load_bucket(store, tail)?;
            let replacement = tail_bucket
                .items
                .pop()
                .ok_or_else(|| PartitionsError::Store("tail bucket is empty".into()))?;
            let replacement_weight = replacement.weight();

            store.put(
                &self.location_key(replacement.name()),
                Location { bucket: loc.bucket }.encode(),
            )?;
            bucket.items[pos] = replacement;

            self.root.bucket_weights[loc.bucket as usize] += replacement_weight;
            self.root.bucket_weights[tail as usize] -= replacement_weight;
            self.save_bucket(store, tail, &tail_bucket)?;
            if tail_bucket.items.is_empty() {
                store.delete(&self.bucket_key(tail))?;
                self.root.bucket_weights.pop();
            }
        }

        self.root.bucket_weights[loc.bucket as usize] -= removed_weight;
        self.root.total_weight -= removed_weight;
        self.root.total_items -= 1;
        if loc.bucket == tail && bucket.items.is_empty() {
            store.delete(&self.bucket_key(loc.bucket))?;
            self.root.bucket_weights.pop();
        } else {
            self.save_bucket(store, loc.bucket, &bucket)?;
        }

        store.delete(&self.location_key(item_name))?;
        self.save_root(store)
    }

    /// Weighted random pick: bucket by subtotal, then item by weight.
    pub fn pick<R: Rng>(
        &self,
        store: &dyn PartitionStore,
        rng: &mut R,
    ) -> Result<T, PartitionsError> {
        if self.root.total_weight == 0 {
            return Err(PartitionsError::Empty);
        }
        let mut r = rng.gen_range(0..self.root.total_weight);
        for (index, subtotal) in self.root.bucket_weights.iter().enumerate() {
            if r >= *subtotal {
                r -= subtotal;
                continue;
            }
            let bucket = self.load_bucket(store, index as u32)?;
            for item in bucket.items {
                let w = item.weight();
                if r < w {
                    return Ok(item);
                }
                r -= w;
            }
            // Subtotal out of sync with bucket contents.
            return Err(PartitionsError::Store(
                "bucket weight subtotal out of sync".into(),
            ));
        }
        Err(PartitionsError::Store(
            "total weight out of sync with subtotals".into(),
        ))
    }

    /// Picks up to `count` distinct items by weight, skipping names in
    /// `exclude`. When the eligible population is not larger than `count`
    /// the whole population is returned in storage order.
    pub fn pick_distinct<R: Rng>(
        &self,
        store: &dyn PartitionStore,
        rng: &mut R,
        count: usize,
        exclude: &[&str],
    ) -> Result<Vec<T>, PartitionsError> {
        let eligible = self
            .items(store)?
            .into_iter()
            .filter(|i| !exclude.contains(&i.name()))
            .collect::<Vec<_>>();
        if eligible.len() <= count {
            return Ok(eligible);
        }

        let mut picked: Vec<T> = Vec::with_capacity(count);
        let mut attempts = 0usize;
        while picked.len() < count {
            // Rejection sampling; bounded because eligible > count.
            let candidate = self.pick(store, rng)?;
            attempts += 1;
            let duplicate = picked.iter().any(|i| i.name() == candidate.name())
                || exclude.contains(&candidate.name());
            if !duplicate {
                picked.push(candidate);
            }
            if attempts > 100 * count {
                // Heavily skewed weights; fall back to storage order for
                // the remainder to keep generation deterministic.
                for item in &eligible {
                    if picked.len() >= count {
                        break;
                    }
                    if !picked.iter().any(|i| i.name() == item.name()) {
                        picked.push(item.clone());
                    }
                }
            }
        }
        Ok(picked)
    }

    /// All items in storage order. Linear; used by settlement paths and
    /// small registries, never by per-block sampling.
    pub fn items(&self, store: &dyn PartitionStore) -> Result<Vec<T>, PartitionsError> {
        let mut all = Vec::with_capacity(self.root.total_items as usize);
        for index in 0..self.root.bucket_weights.len() {
            all.extend(self.load_bucket(store, index as u32)?.items);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MemStore {
        map: BTreeMap<Vec<u8>, Vec<u8>>,
    }

    impl PartitionStore for MemStore {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PartitionsError> {
            Ok(self.map.get(key).cloned())
        }
        fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), PartitionsError> {
            self.map.insert(key.to_vec(), value);
            Ok(())
        }
        fn delete(&mut self, key: &[u8]) -> Result<(), PartitionsError> {
            self.map.remove(key);
            Ok(())
        }
    }

    #[derive(Encode, Decode, Clone, Debug, PartialEq)]
    struct Item {
        id: String,
        weight: u64,
    }

    impl PartitionItem for Item {
        fn name(&self) -> &str {
            &self.id
        }
        fn weight(&self) -> u64 {
            self.weight
        }
    }

    fn item(id: &str, weight: u64) -> Item {
        Item {
            id: id.to_string(),
            weight,
        }
    }

    fn open(store: &MemStore) -> Partitions<Item> {
        Partitions::open(store, b"test_parts", 3).unwrap()
    }

    #[test]
    fn add_get_remove_roundtrip() {
        let mut store = MemStore::default();
        let mut parts = open(&store);
        for i in 0..10 {
            parts.add(&mut store, &item(&format!("b{i}"), 1)).unwrap();
        }
        assert_eq!(parts.len(), 10);
        assert_eq!(parts.total_weight(), 10);
        assert_eq!(parts.get(&store, "b7").unwrap(), Some(item("b7", 1)));

        parts.remove(&mut store, "b2").unwrap();
        assert_eq!(parts.len(), 9);
        assert!(!parts.contains(&store, "b2").unwrap());
        // Reopen and observe the same state.
        let reopened: Partitions<Item> = Partitions::open(&store, b"test_parts", 3).unwrap();
        assert_eq!(reopened.len(), 9);
        assert_eq!(reopened.total_weight(), 9);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut store = MemStore::default();
        let mut parts = open(&store);
        parts.add(&mut store, &item("dup", 1)).unwrap();
        assert_eq!(
            parts.add(&mut store, &item("dup", 1)),
            Err(PartitionsError::ItemAlreadyExists("dup".into()))
        );
    }

    #[test]
    fn update_adjusts_weights() {
        let mut store = MemStore::default();
        let mut parts = open(&store);
        parts.add(&mut store, &item("a", 5)).unwrap();
        parts.add(&mut store, &item("b", 5)).unwrap();
        parts.update(&mut store, &item("a", 15)).unwrap();
        assert_eq!(parts.total_weight(), 20);
        assert_eq!(parts.get(&store, "a").unwrap().unwrap().weight, 15);
    }

    #[test]
    fn pick_is_deterministic_for_a_seed() {
        let mut store = MemStore::default();
        let mut parts = open(&store);
        for i in 0..7 {
            parts.add(&mut store, &item(&format!("b{i}"), (i + 1) as u64)).unwrap();
        }
        let a = parts
            .pick(&store, &mut ChaCha20Rng::from_seed([7u8; 32]))
            .unwrap();
        let b = parts
            .pick(&store, &mut ChaCha20Rng::from_seed([7u8; 32]))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pick_respects_weights() {
        let mut store = MemStore::default();
        let mut parts = open(&store);
        parts.add(&mut store, &item("light", 1)).unwrap();
        parts.add(&mut store, &item("heavy", 999)).unwrap();
        let mut rng = ChaCha20Rng::from_seed([1u8; 32]);
        let heavy_hits = (0..100)
            .filter(|_| parts.pick(&store, &mut rng).unwrap().id == "heavy")
            .count();
        assert!(heavy_hits > 90, "heavy picked only {heavy_hits} times");
    }

    #[test]
    fn pick_distinct_returns_all_when_small() {
        let mut store = MemStore::default();
        let mut parts = open(&store);
        parts.add(&mut store, &item("a", 1)).unwrap();
        parts.add(&mut store, &item("b", 1)).unwrap();
        let mut rng = ChaCha20Rng::from_seed([2u8; 32]);
        let picked = parts.pick_distinct(&store, &mut rng, 5, &[]).unwrap();
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn pick_distinct_excludes_names() {
        let mut store = MemStore::default();
        let mut parts = open(&store);
        for i in 0..6 {
            parts.add(&mut store, &item(&format!("v{i}"), 1)).unwrap();
        }
        let mut rng = ChaCha20Rng::from_seed([3u8; 32]);
        let picked = parts.pick_distinct(&store, &mut rng, 3, &["v0"]).unwrap();
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|i| i.id != "v0"));
        let names: std::collections::BTreeSet<_> = picked.iter().map(|i| i.id.clone()).collect();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn empty_pick_fails() {
        let store = MemStore::default();
        let parts = open(&store);
        assert_eq!(
            parts
                .pick(&store, &mut ChaCha20Rng::from_seed([0u8; 32]))
                .unwrap_err(),
            PartitionsError::Empty
        );
    }

    #[test]
    fn remove_from_middle_bucket_backfills_from_tail() {
        let mut store = MemStore::default();
        let mut parts = open(&store);
        // 3 per bucket: buckets [a0 a1 a2][a3 a4 a5][a6]
        for i in 0..7 {
            parts.add(&mut store, &item(&format!("a{i}"), 2)).unwrap();
        }
        parts.remove(&mut store, "a1").unwrap();
        assert_eq!(parts.len(), 6);
        assert_eq!(parts.total_weight(), 12);
        // The tail item moved into the hole and is still reachable.
        assert!(parts.contains(&store, "a6").unwrap());
        for name in ["a0", "a2", "a3", "a4", "a5", "a6"] {
            assert!(parts.get(&store, name).unwrap().is_some(), "{name} lost");
        }
    }
}
