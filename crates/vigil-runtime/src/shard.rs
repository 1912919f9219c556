//! Key-sharded maps
//!
//! State keyed by [`GroupKey`] is split across a fixed number of shards,
//! each behind its own `RwLock`. Work on keys of different shards proceeds
//! in parallel; work on the same key serializes on its shard lock.
//!
//! Operations that must see every shard at once (table scans) acquire the
//! locks in ascending shard index, which is the only multi-shard lock order
//! used anywhere, so two scans can never deadlock each other.

use rustc_hash::{FxBuildHasher, FxHashMap};
use std::hash::BuildHasher;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use vigil_core::GroupKey;

pub type Shard<T> = FxHashMap<GroupKey, T>;

#[derive(Debug)]
pub struct Sharded<T> {
    shards: Box<[RwLock<Shard<T>>]>,
}

impl<T> Sharded<T> {
    pub fn new(count: usize) -> Self {
        let shards = (0..count.max(1))
            .map(|_| RwLock::new(FxHashMap::default()))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, key: &GroupKey) -> usize {
        (FxBuildHasher.hash_one(key) % self.shards.len() as u64) as usize
    }

    pub fn read(&self, key: &GroupKey) -> RwLockReadGuard<'_, Shard<T>> {
        self.read_shard(self.shard_of(key))
    }

    pub fn write(&self, key: &GroupKey) -> RwLockWriteGuard<'_, Shard<T>> {
        self.write_shard(self.shard_of(key))
    }

    pub fn read_shard(&self, index: usize) -> RwLockReadGuard<'_, Shard<T>> {
        self.shards[index]
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn write_shard(&self, index: usize) -> RwLockWriteGuard<'_, Shard<T>> {
        self.shards[index]
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Write guards of every shard, taken in index order.
    pub fn write_all(&self) -> Vec<RwLockWriteGuard<'_, Shard<T>>> {
        (0..self.shards.len()).map(|i| self.write_shard(i)).collect()
    }

    /// Read guards of every shard, taken in index order.
    pub fn read_all(&self) -> Vec<RwLockReadGuard<'_, Shard<T>>> {
        (0..self.shards.len()).map(|i| self.read_shard(i)).collect()
    }

    pub fn len(&self) -> usize {
        self.read_all().iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use vigil_core::Value;

    #[test]
    fn test_same_key_same_shard() {
        let sharded: Sharded<i64> = Sharded::new(8);
        let key = GroupKey::single(Value::from("k"));
        assert_eq!(sharded.shard_of(&key), sharded.shard_of(&key.clone()));
        assert!(sharded.shard_of(&key) < 8);
    }

    #[test]
    fn test_zero_shards_is_one() {
        let sharded: Sharded<i64> = Sharded::new(0);
        assert_eq!(sharded.shard_count(), 1);
        sharded.write(&GroupKey::empty()).insert(GroupKey::empty(), 1);
        assert_eq!(sharded.len(), 1);
    }

    #[test]
    fn test_concurrent_counters() {
        let sharded = Arc::new(Sharded::<i64>::new(4));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sharded = Arc::clone(&sharded);
                thread::spawn(move || {
                    for i in 0..1000 {
                        let key = GroupKey::single(Value::Int((i + t) % 16));
                        *sharded.write(&key).entry(key.clone()).or_insert(0) += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total: i64 = sharded
            .read_all()
            .iter()
            .flat_map(|s| s.values().copied().collect::<Vec<_>>())
            .sum();
        assert_eq!(total, 4000);
        assert_eq!(sharded.len(), 16);
    }
}
