//! Two-tier write-through cache: an LRU front over a persistent
//! [`Storage`] back.
//!
//! A single internal lock covers the LRU, the dirty set and the seal set,
//! which makes every operation linearizable per key. Keys are namespaced
//! in the back-store by the cache prefix (`evidence/`, `session/`, ...);
//! seals are persisted as marker keys so they survive restarts.

use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::{Result, Storage, StorageError};

const SEAL_PREFIX: &str = "sealed/";

/// Anything the periodic flush task can write back.
pub trait Flushable: Send + Sync {
    fn name(&self) -> &str;
    fn flush_all(&self) -> Result<usize>;
}

struct CacheInner<V> {
    lru: LruCache<String, V>,
    dirty: HashSet<String>,
    sealed: HashSet<String>,
}

pub struct Cache<V> {
    prefix: String,
    store: Arc<dyn Storage>,
    inner: Mutex<CacheInner<V>>,
}

impl<V> Cache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send,
{
    /// Opens a cache over `store`, restoring the seal set persisted under
    /// `prefix`.
    pub fn open(store: Arc<dyn Storage>, prefix: impl Into<String>, capacity: usize) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.starts_with(SEAL_PREFIX) {
            return Err(StorageError::InvalidData {
                key: prefix,
                reason: "cache prefix must be non-empty and outside the seal namespace".into(),
            });
        }
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);

        let seal_namespace = format!("{}{}", SEAL_PREFIX, prefix);
        let sealed = store
            .list_keys(seal_namespace.as_bytes())?
            .into_iter()
            .filter_map(|k| {
                String::from_utf8(k)
                    .ok()
                    .and_then(|k| k.strip_prefix(&seal_namespace).map(str::to_string))
            })
            .collect::<HashSet<_>>();
        if !sealed.is_empty() {
            debug!("cache {}: restored {} sealed keys", prefix, sealed.len());
        }

        Ok(Self {
            prefix,
            store,
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(cap),
                dirty: HashSet::new(),
                sealed,
            }),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn back_key(&self, key: &str) -> Vec<u8> {
        format!("{}{}", self.prefix, key).into_bytes()
    }

    fn seal_key(&self, key: &str) -> Vec<u8> {
        format!("{}{}{}", SEAL_PREFIX, self.prefix, key).into_bytes()
    }

    fn encode(&self, key: &str, value: &V) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| StorageError::InvalidData {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<V> {
        bincode::deserialize(bytes).map_err(|e| StorageError::InvalidData {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Inserts into the LRU, writing back a dirty entry if one is evicted.
    fn insert_front(&self, inner: &mut CacheInner<V>, key: String, value: V) -> Result<()> {
        if let Some((evicted_key, evicted)) = inner.lru.push(key.clone(), value) {
            if evicted_key != key && inner.dirty.remove(&evicted_key) {
                let bytes = self.encode(&evicted_key, &evicted)?;
                self.store.put(&self.back_key(&evicted_key), &bytes)?;
            }
        }
        Ok(())
    }

    /// Front first; on a miss the back-store is consulted and the value
    /// promoted.
    pub fn get(&self, key: &str) -> Result<Option<V>> {
        let mut inner = self.inner.lock();
        if let Some(value) = inner.lru.get(key) {
            return Ok(Some(value.clone()));
        }
        let Some(bytes) = self.store.get(&self.back_key(key))? else {
            return Ok(None);
        };
        let value = self.decode(key, &bytes)?;
        self.insert_front(&mut inner, key.to_string(), value.clone())?;
        Ok(Some(value))
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        let inner = self.inner.lock();
        if inner.lru.contains(key) {
            return Ok(true);
        }
        self.store.exists(&self.back_key(key))
    }

    /// Writes to the front and marks the key dirty. Rejected on sealed keys.
    pub fn set(&self, key: &str, value: V) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.sealed.contains(key) {
            return Err(StorageError::Sealed(key.to_string()));
        }
        inner.dirty.insert(key.to_string());
        self.insert_front(&mut inner, key.to_string(), value)
    }

    /// `set` followed by an immediate write-back of that key.
    pub fn set_and_flush(&self, key: &str, value: V) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.sealed.contains(key) {
            return Err(StorageError::Sealed(key.to_string()));
        }
        let bytes = self.encode(key, &value)?;
        self.store.put(&self.back_key(key), &bytes)?;
        inner.dirty.remove(key);
        self.insert_front(&mut inner, key.to_string(), value)
    }

    /// Marks `key` immutable. Any pending write for it is flushed first so
    /// the sealed value is the durable one.
    pub fn seal(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.sealed.contains(key) {
            return Ok(());
        }
        if inner.dirty.contains(key) {
            if let Some(value) = inner.lru.peek(key) {
                let bytes = self.encode(key, value)?;
                self.store.put(&self.back_key(key), &bytes)?;
            }
            inner.dirty.remove(key);
        }
        self.store.put(&self.seal_key(key), &[1u8])?;
        inner.sealed.insert(key.to_string());
        Ok(())
    }

    pub fn is_sealed(&self, key: &str) -> bool {
        self.inner.lock().sealed.contains(key)
    }

    /// Removes the value and its seal, from both tiers.
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.lru.pop(key);
        inner.dirty.remove(key);
        self.store.delete(&self.back_key(key))?;
        if inner.sealed.remove(key) {
            self.store.delete(&self.seal_key(key))?;
        }
        Ok(())
    }

    pub fn flush_key(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.dirty.contains(key) {
            return Ok(());
        }
        if let Some(value) = inner.lru.peek(key) {
            let bytes = self.encode(key, value)?;
            self.store.put(&self.back_key(key), &bytes)?;
        }
        inner.dirty.remove(key);
        Ok(())
    }

    fn flush_locked(&self, inner: &mut CacheInner<V>) -> Result<usize> {
        if inner.dirty.is_empty() {
            return Ok(0);
        }
        let mut batch = Vec::with_capacity(inner.dirty.len());
        for key in inner.dirty.iter() {
            if let Some(value) = inner.lru.peek(key) {
                batch.push((self.back_key(key), self.encode(key, value)?));
            }
        }
        self.store.write_batch(&batch)?;
        inner.dirty.clear();
        Ok(batch.len())
    }

    /// Flushes all dirty entries, then snapshots the back-store in key
    /// order. The returned iterator owns its data, so iteration can be
    /// restarted by calling `iter` again.
    pub fn iter(&self) -> Result<std::vec::IntoIter<(String, V)>> {
        self.iter_prefix("")
    }

    /// Like [`Cache::iter`], restricted to keys starting with `sub`.
    pub fn iter_prefix(&self, sub: &str) -> Result<std::vec::IntoIter<(String, V)>> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)?;
        let scan = format!("{}{}", self.prefix, sub);
        let entries = self.store.scan_prefix(scan.as_bytes())?;
        drop(inner);

        let mut out = Vec::with_capacity(entries.len());
        for (raw_key, bytes) in entries {
            let Ok(full) = String::from_utf8(raw_key) else {
                warn!("cache {}: skipping non-utf8 key", self.prefix);
                continue;
            };
            let key = full[self.prefix.len()..].to_string();
            let value = self.decode(&key, &bytes)?;
            out.push((key, value));
        }
        Ok(out.into_iter())
    }

    pub fn cached_len(&self) -> usize {
        self.inner.lock().lru.len()
    }
}

impl<V> Flushable for Cache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send,
{
    fn name(&self) -> &str {
        &self.prefix
    }

    fn flush_all(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn cache(capacity: usize) -> (Arc<MemoryStorage>, Cache<u64>) {
        let store = Arc::new(MemoryStorage::new());
        let cache = Cache::open(store.clone(), "test/", capacity).unwrap();
        (store, cache)
    }

    #[test]
    fn test_set_is_lazy_until_flush() {
        let (store, cache) = cache(4);
        cache.set("a", 1).unwrap();
        assert_eq!(store.get(b"test/a").unwrap(), None);
        assert_eq!(cache.get("a").unwrap(), Some(1));
        assert_eq!(cache.flush_all().unwrap(), 1);
        assert!(store.get(b"test/a").unwrap().is_some());
    }

    #[test]
    fn test_eviction_writes_back_dirty_entries() {
        let (store, cache) = cache(1);
        cache.set("a", 1).unwrap();
        cache.set("b", 2).unwrap();
        assert!(store.get(b"test/a").unwrap().is_some());
        // "a" is reloaded from the back-store on demand
        assert_eq!(cache.get("a").unwrap(), Some(1));
        assert_eq!(cache.get("b").unwrap(), Some(2));
    }

    #[test]
    fn test_sealed_key_rejects_set_and_survives_reopen() {
        let (store, cache) = cache(4);
        cache.set("a", 1).unwrap();
        cache.seal("a").unwrap();
        assert_eq!(cache.set("a", 2), Err(StorageError::Sealed("a".into())));
        assert_eq!(cache.get("a").unwrap(), Some(1));

        let reopened: Cache<u64> = Cache::open(store, "test/", 4).unwrap();
        assert!(reopened.is_sealed("a"));
        assert_eq!(reopened.get("a").unwrap(), Some(1));
    }

    #[test]
    fn test_iter_is_ordered_and_restartable() {
        let (_store, cache) = cache(8);
        for (k, v) in [("c", 3u64), ("a", 1), ("b", 2)] {
            cache.set(k, v).unwrap();
        }
        let first: Vec<(String, u64)> = cache.iter().unwrap().collect();
        assert_eq!(
            first,
            vec![("a".to_string(), 1), ("b".to_string(), 2), ("c".to_string(), 3)]
        );
        let second: Vec<(String, u64)> = cache.iter().unwrap().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_iter_prefix_scopes_keys() {
        let (_store, cache) = cache(8);
        cache.set("x/1", 1).unwrap();
        cache.set("x/2", 2).unwrap();
        cache.set("y/1", 3).unwrap();
        let keys: Vec<String> = cache.iter_prefix("x/").unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["x/1".to_string(), "x/2".to_string()]);
    }

    #[test]
    fn test_delete_clears_seal() {
        let (_store, cache) = cache(4);
        cache.set_and_flush("a", 1).unwrap();
        cache.seal("a").unwrap();
        cache.delete("a").unwrap();
        assert!(!cache.is_sealed("a"));
        assert_eq!(cache.get("a").unwrap(), None);
        cache.set("a", 5).unwrap();
    }

    #[test]
    fn test_full_store_propagates() {
        let store = Arc::new(MemoryStorage::with_capacity_bytes(8));
        let cache: Cache<u64> = Cache::open(store, "t/", 4).unwrap();
        assert_eq!(cache.set_and_flush("key", 1), Err(StorageError::Full));
    }
}
