//! Concurrency utilities shared across the agent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

const SHARD_COUNT: usize = 32;

/// A thread-safe map from string keys to Unix-second timestamps.
///
/// To avoid a single global lock the map is divided into [`SHARD_COUNT`]
/// shards, each guarded by its own read/write lock. The shard for a key is
/// chosen by its FNV-1a hash, so lookups touch exactly one lock and only for
/// the duration of a scalar map operation.
#[derive(Clone)]
pub struct ConcurrentMap {
    shards: Arc<Vec<RwLock<HashMap<String, i64>>>>,
}

impl Default for ConcurrentMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentMap {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self {
            shards: Arc::new(shards),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, i64>> {
        &self.shards[fnv1a_32(key.as_bytes()) as usize % SHARD_COUNT]
    }

    /// Sets the given value under the specified key.
    pub fn set(&self, key: &str, value: i64) {
        let mut shard = self.shard(key).write().expect("map shard poisoned");
        shard.insert(key.to_string(), value);
    }

    /// Retrieves the value stored under the given key, if any.
    pub fn get(&self, key: &str) -> Option<i64> {
        let shard = self.shard(key).read().expect("map shard poisoned");
        shard.get(key).copied()
    }

    /// Returns true if the key is present.
    pub fn has(&self, key: &str) -> bool {
        let shard = self.shard(key).read().expect("map shard poisoned");
        shard.contains_key(key)
    }

    /// Removes the key from the map.
    pub fn remove(&self, key: &str) {
        let mut shard = self.shard(key).write().expect("map shard poisoned");
        shard.remove(key);
    }

    /// Returns the number of entries across all shards.
    pub fn count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().expect("map shard poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Returns a point-in-time snapshot of all entries, pre-sized to the
    /// current count. Shards are locked one at a time, so entries mutated
    /// concurrently may or may not be reflected.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let mut entries = Vec::with_capacity(self.count());
        for shard in self.shards.iter() {
            let shard = shard.read().expect("map shard poisoned");
            entries.extend(shard.iter().map(|(k, v)| (k.clone(), *v)));
        }
        entries
    }
}

impl Serialize for ConcurrentMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries = self.snapshot();
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            map.serialize_entry(&key, &value)?;
        }
        map.end()
    }
}

/// 32-bit FNV-1a hash, used to pick the shard for a key.
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let map = ConcurrentMap::new();
        map.set("evt-1", 100);
        map.set("evt-2", 200);
        assert_eq!(map.get("evt-1"), Some(100));
        assert_eq!(map.get("evt-2"), Some(200));
        assert_eq!(map.get("evt-3"), None);
    }

    #[test]
    fn set_overwrites_existing_value() {
        let map = ConcurrentMap::new();
        map.set("evt-1", 100);
        map.set("evt-1", 300);
        assert_eq!(map.get("evt-1"), Some(300));
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn has_and_remove() {
        let map = ConcurrentMap::new();
        assert!(!map.has("evt-1"));
        map.set("evt-1", 1);
        assert!(map.has("evt-1"));
        map.remove("evt-1");
        assert!(!map.has("evt-1"));
        assert!(map.is_empty());
    }

    #[test]
    fn count_spans_all_shards() {
        let map = ConcurrentMap::new();
        for i in 0..1000 {
            map.set(&format!("evt-{i}"), i);
        }
        assert_eq!(map.count(), 1000);
    }

    #[test]
    fn snapshot_contains_every_entry() {
        let map = ConcurrentMap::new();
        for i in 0..100 {
            map.set(&format!("evt-{i}"), i);
        }
        let mut entries = map.snapshot();
        entries.sort();
        assert_eq!(entries.len(), 100);
        assert_eq!(entries[0], ("evt-0".to_string(), 0));
    }

    #[test]
    fn serializes_to_flat_json_map() {
        let map = ConcurrentMap::new();
        map.set("a", 1);
        map.set("b", 2);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["a"], 1);
        assert_eq!(json["b"], 2);
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[test]
    fn concurrent_writers_do_not_lose_entries() {
        let map = ConcurrentMap::new();
        let mut handles = Vec::new();
        for t in 0..8 {
            let map = map.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    map.set(&format!("t{t}-evt-{i}"), i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.count(), 800);
    }
}
