//! Key-value back-stores and the two-tier write-through cache on top.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod memory;
#[cfg(feature = "persistence")]
pub mod rocksdb_storage;

pub use cache::{Cache, Flushable};
pub use memory::MemoryStorage;
#[cfg(feature = "persistence")]
pub use rocksdb_storage::RocksDbStorage;

// Storage-specific Result type
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("store is full")]
    Full,

    #[error("key {0} is sealed")]
    Sealed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid data under {key}: {reason}")]
    InvalidData { key: String, reason: String },
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub used_size: u64,
    pub num_entries: u64,
    pub read_operations: u64,
    pub write_operations: u64,
}

/// Persistent back-store. Implementations handle their own
/// synchronization; iteration is in ascending key order.
pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn get_stats(&self) -> Result<StorageStats>;
    fn flush(&self) -> Result<()>;

    fn write_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn list_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }
}
