//! In-memory access layer: the row cache the lock manager protects.
//!
//! Rows fetched from the data storage broker are cached here; writes of a
//! committing transaction install their post-images so later operations
//! observe them. Buckets are guarded independently so unrelated keys do not
//! contend.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use super::types::{ShardId, TableId, TupleId};

/// Full key of one cached row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub table_id: TableId,
    pub shard_id: ShardId,
    pub tuple_id: TupleId,
}

pub struct AccessStore {
    buckets: Vec<RwLock<HashMap<RowKey, Vec<u8>>>>,
}

impl AccessStore {
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            buckets: (0..buckets).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn bucket(&self, key: &RowKey) -> &RwLock<HashMap<RowKey, Vec<u8>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.buckets.len();
        &self.buckets[idx]
    }

    pub fn get(&self, key: RowKey) -> Option<Vec<u8>> {
        self.bucket(&key)
            .read()
            .ok()
            .and_then(|map| map.get(&key).cloned())
    }

    pub fn contains(&self, key: RowKey) -> bool {
        self.bucket(&key)
            .read()
            .map(|map| map.contains_key(&key))
            .unwrap_or(false)
    }

    pub fn put(&self, key: RowKey, row: Vec<u8>) {
        if let Ok(mut map) = self.bucket(&key).write() {
            map.insert(key, row);
        }
    }

    pub fn remove(&self, key: RowKey) -> Option<Vec<u8>> {
        self.bucket(&key)
            .write()
            .ok()
            .and_then(|mut map| map.remove(&key))
    }

    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .filter_map(|bucket| bucket.read().ok().map(|map| map.len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
