use super::{Result, Storage, StorageError, StorageStats};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ordered in-memory storage, used by tests and by nodes running without
/// the `persistence` feature.
pub struct MemoryStorage {
    data: Mutex<Inner>,
    /// Maximum number of bytes (keys + values); `None` is unbounded
    capacity: Option<u64>,
    reads: AtomicU64,
    writes: AtomicU64,
}

#[derive(Default)]
struct Inner {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    used: u64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Inner::default()),
            capacity: None,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn with_capacity_bytes(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.lock().map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let existing = data
            .map
            .get(key)
            .map(|v| (key.len() + v.len()) as u64)
            .unwrap_or(0);
        let used = data.used - existing + (key.len() + value.len()) as u64;
        if let Some(capacity) = self.capacity {
            if used > capacity {
                return Err(StorageError::Full);
            }
        }
        data.map.insert(key.to_vec(), value.to_vec());
        data.used = used;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        if let Some(v) = data.map.remove(key) {
            data.used -= (key.len() + v.len()) as u64;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock();
        Ok(data
            .map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn get_stats(&self) -> Result<StorageStats> {
        let data = self.data.lock();
        Ok(StorageStats {
            used_size: data.used,
            num_entries: data.map.len() as u64,
            read_operations: self.reads.load(Ordering::Relaxed),
            write_operations: self.writes.load(Ordering::Relaxed),
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
