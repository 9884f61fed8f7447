use super::{Result, Storage, StorageError, StorageStats};
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// RocksDB-backed store for evidence and protocol records.
pub struct RocksDbStorage {
    db: DB,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RocksDbStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|e| StorageError::Io(format!("open: {}", e)))?;
        Ok(Self {
            db,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }
}

fn io(err: rocksdb::Error) -> StorageError {
    StorageError::Io(err.to_string())
}

impl Storage for RocksDbStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.db.get(key).map_err(io)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.db.put(key, value).map_err(io)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.db.delete(key).map_err(io)
    }

    fn write_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put(key, value);
        }
        self.writes.fetch_add(entries.len() as u64, Ordering::Relaxed);
        self.db.write(batch).map_err(io)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(io)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn get_stats(&self) -> Result<StorageStats> {
        let num_entries = self
            .db
            .property_int_value("rocksdb.estimate-num-keys")
            .map_err(io)?
            .unwrap_or(0);
        let used_size = self
            .db
            .property_int_value("rocksdb.total-sst-files-size")
            .map_err(io)?
            .unwrap_or(0);
        Ok(StorageStats {
            used_size,
            num_entries,
            read_operations: self.reads.load(Ordering::Relaxed),
            write_operations: self.writes.load(Ordering::Relaxed),
        })
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(io)
    }
}
