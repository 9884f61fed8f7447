use dashmap::DashMap;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::crypto::{sha3_256_concat, to_canonical_json, Hash, PublicKey};
use crate::error::{Error, Result};
use crate::storage::{Cache, Flushable, Storage, StorageError};
use crate::types::{EvidenceKind, EvidenceLeaf, SessionHeader};

use super::{BloomFilter, Evidence, EvidenceMeta};

pub const EVIDENCE_PREFIX: &str = "evidence/";
const LEAF_PREFIX: &str = "leaf/";

/// `SHA3-256(canonical(header) || kind)`
pub fn evidence_key(header: &SessionHeader, kind: EvidenceKind) -> Result<Hash> {
    let encoded = to_canonical_json(header)?;
    Ok(sha3_256_concat(&[&encoded, &[kind.as_byte()]]))
}

fn leaf_key(key: &str, index: u64) -> String {
    format!("{}/{:020}", key, index)
}

/// Evidence store for one servicer identity.
///
/// Appends to one evidence object are serialized by a per-key lock;
/// different objects proceed in parallel.
pub struct EvidenceManager {
    servicer: PublicKey,
    meta: Cache<EvidenceMeta>,
    leaves: Cache<EvidenceLeaf>,
    locks: DashMap<Hash, Arc<Mutex<()>>>,
    bloom_expected: usize,
    bloom_rate: f64,
}

impl EvidenceManager {
    pub fn open(
        store: Arc<dyn Storage>,
        servicer: PublicKey,
        capacity: usize,
        bloom_expected: usize,
        bloom_rate: f64,
    ) -> Result<Self> {
        let identity = servicer.address();
        Ok(Self {
            servicer,
            meta: Cache::open(store.clone(), format!("{}{}/", EVIDENCE_PREFIX, identity), capacity)?,
            leaves: Cache::open(store, format!("{}{}/", LEAF_PREFIX, identity), capacity)?,
            locks: DashMap::new(),
            bloom_expected,
            bloom_rate,
        })
    }

    pub fn servicer(&self) -> &PublicKey {
        &self.servicer
    }

    fn lock_for(&self, key: &Hash) -> Arc<Mutex<()>> {
        self.locks.entry(*key).or_default().clone()
    }

    /// Durably appends `proof` to its evidence object, creating the object
    /// on first use. Returns the key and the updated metadata.
    pub fn add_proof(&self, proof: EvidenceLeaf) -> Result<(Hash, EvidenceMeta)> {
        let header = proof.session_header();
        let kind = proof.kind();
        if let EvidenceLeaf::Relay(relay) = &proof {
            if relay.servicer_pub_key != self.servicer {
                return Err(Error::UnknownServicer(relay.servicer_pub_key.to_hex()));
            }
        }
        let key = evidence_key(&header, kind)?;
        let key_hex = key.to_hex();
        let entropy = proof.entropy();

        let lock = self.lock_for(&key);
        let _guard = lock.lock();

        let mut meta = match self.meta.get(&key_hex)? {
            Some(meta) => meta,
            None => EvidenceMeta {
                session_header: header,
                evidence_kind: kind,
                servicer: self.servicer,
                leaf_count: 0,
                total_payable_relays: 0,
                bloom: BloomFilter::with_rate(self.bloom_expected, self.bloom_rate),
                sealed: false,
            },
        };
        if meta.sealed || self.meta.is_sealed(&key_hex) {
            return Err(StorageError::Sealed(key_hex).into());
        }
        if meta.bloom.may_contain(entropy) && self.has_entropy(&key_hex, entropy)? {
            return Err(Error::DuplicateProof(entropy));
        }

        self.leaves
            .set_and_flush(&leaf_key(&key_hex, meta.leaf_count), proof)?;
        meta.leaf_count += 1;
        if kind == EvidenceKind::Relay {
            meta.total_payable_relays += 1;
        }
        meta.bloom.insert(entropy);
        self.meta.set_and_flush(&key_hex, meta.clone())?;
        debug!("evidence {} now holds {} leaves", key_hex, meta.leaf_count);
        Ok((key, meta))
    }

    /// Cheap admission check before any work is done for a proof: fails
    /// when the evidence is sealed or already holds `entropy`.
    pub fn precheck(&self, header: &SessionHeader, kind: EvidenceKind, entropy: i64) -> Result<()> {
        let key_hex = evidence_key(header, kind)?.to_hex();
        let Some(meta) = self.meta.get(&key_hex)? else {
            return Ok(());
        };
        if meta.sealed {
            return Err(StorageError::Sealed(key_hex).into());
        }
        if meta.bloom.may_contain(entropy) && self.has_entropy(&key_hex, entropy)? {
            return Err(Error::DuplicateProof(entropy));
        }
        Ok(())
    }

    /// Confirmatory scan behind a positive bloom answer.
    fn has_entropy(&self, key_hex: &str, entropy: i64) -> Result<bool> {
        Ok(self
            .leaves
            .iter_prefix(&format!("{}/", key_hex))?
            .any(|(_, leaf)| leaf.entropy() == entropy))
    }

    pub fn get(&self, key: &Hash) -> Result<Option<EvidenceMeta>> {
        Ok(self.meta.get(&key.to_hex())?)
    }

    pub fn get_by_header(&self, header: &SessionHeader, kind: EvidenceKind) -> Result<Option<EvidenceMeta>> {
        self.get(&evidence_key(header, kind)?)
    }

    /// Metadata plus leaves in arrival order.
    pub fn load(&self, key: &Hash) -> Result<Option<Evidence>> {
        let key_hex = key.to_hex();
        let Some(meta) = self.meta.get(&key_hex)? else {
            return Ok(None);
        };
        let proofs: Vec<EvidenceLeaf> = self
            .leaves
            .iter_prefix(&format!("{}/", key_hex))?
            .map(|(_, leaf)| leaf)
            .take(meta.leaf_count as usize)
            .collect();
        if proofs.len() as u64 != meta.leaf_count {
            return Err(StorageError::InvalidData {
                key: key_hex,
                reason: format!("expected {} leaves, found {}", meta.leaf_count, proofs.len()),
            }
            .into());
        }
        Ok(Some(Evidence { meta, proofs }))
    }

    /// Leaf at `index` in Merkle order.
    pub fn get_proof(&self, key: &Hash, index: u64) -> Result<EvidenceLeaf> {
        let evidence = self
            .load(key)?
            .ok_or_else(|| Error::MalformedProof(format!("no evidence {}", key)))?;
        evidence
            .leaf_at(index as usize)?
            .cloned()
            .ok_or_else(|| Error::MalformedProof(format!("no leaf {} in evidence {}", index, key)))
    }

    /// Makes the evidence immutable. Idempotent.
    pub fn seal(&self, key: &Hash) -> Result<EvidenceMeta> {
        let key_hex = key.to_hex();
        let lock = self.lock_for(key);
        let _guard = lock.lock();
        let mut meta = self
            .meta
            .get(&key_hex)?
            .ok_or_else(|| Error::MalformedProof(format!("no evidence {}", key_hex)))?;
        if !meta.sealed {
            meta.sealed = true;
            self.meta.set_and_flush(&key_hex, meta.clone())?;
        }
        self.meta.seal(&key_hex)?;
        info!("sealed evidence {} with {} leaves", key_hex, meta.leaf_count);
        Ok(meta)
    }

    pub fn is_sealed(&self, key: &Hash) -> bool {
        self.meta.is_sealed(&key.to_hex())
    }

    pub fn delete(&self, key: &Hash) -> Result<()> {
        let key_hex = key.to_hex();
        {
            let lock = self.lock_for(key);
            let _guard = lock.lock();
            let leaf_keys: Vec<String> = self
                .leaves
                .iter_prefix(&format!("{}/", key_hex))?
                .map(|(k, _)| k)
                .collect();
            for leaf in leaf_keys {
                self.leaves.delete(&leaf)?;
            }
            self.meta.delete(&key_hex)?;
        }
        self.locks.remove(key);
        debug!("deleted evidence {}", key_hex);
        Ok(())
    }

    /// All evidence objects, in key order.
    pub fn list(&self) -> Result<Vec<(Hash, EvidenceMeta)>> {
        self.meta
            .iter()?
            .map(|(k, meta)| Ok((Hash::from_hex(&k)?, meta)))
            .collect()
    }

    pub fn flushables(&self) -> [&dyn Flushable; 2] {
        [&self.meta, &self.leaves]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{PrivateKey, Signature};
    use crate::storage::MemoryStorage;
    use crate::types::{Aat, RelayProof};

    fn manager() -> (PrivateKey, EvidenceManager) {
        let servicer = PrivateKey::from_seed([1u8; 32]);
        let manager = EvidenceManager::open(
            Arc::new(MemoryStorage::new()),
            servicer.public_key(),
            64,
            100,
            0.01,
        )
        .unwrap();
        (servicer, manager)
    }

    fn relay_leaf(servicer: &PublicKey, entropy: i64) -> EvidenceLeaf {
        let requestor = PrivateKey::from_seed([2u8; 32]);
        EvidenceLeaf::Relay(RelayProof {
            request_hash: "00".repeat(32),
            entropy,
            session_block_height: 1,
            servicer_pub_key: *servicer,
            blockchain: "0001".into(),
            geo_zone: "0001".into(),
            num_servicers: 5,
            aat: Aat::new_signed(&requestor, requestor.public_key()).unwrap(),
            signature: Signature([0u8; 64]),
        })
    }

    #[test]
    fn test_duplicate_entropy_leaves_store_unchanged() {
        let (servicer, manager) = manager();
        let (key, meta) = manager.add_proof(relay_leaf(&servicer.public_key(), 7)).unwrap();
        assert_eq!(meta.leaf_count, 1);
        assert!(matches!(
            manager.add_proof(relay_leaf(&servicer.public_key(), 7)),
            Err(Error::DuplicateProof(7))
        ));
        let evidence = manager.load(&key).unwrap().unwrap();
        assert_eq!(evidence.proofs.len(), 1);
        assert_eq!(evidence.meta.total_payable_relays, 1);
    }

    #[test]
    fn test_foreign_servicer_rejected() {
        let (_servicer, manager) = manager();
        let other = PrivateKey::from_seed([9u8; 32]).public_key();
        assert!(matches!(
            manager.add_proof(relay_leaf(&other, 1)),
            Err(Error::UnknownServicer(_))
        ));
    }

    #[test]
    fn test_sealed_rejects_append_and_root_is_stable() {
        let (servicer, manager) = manager();
        let mut key = Hash::ZERO;
        for e in [30i64, 10, 20] {
            key = manager.add_proof(relay_leaf(&servicer.public_key(), e)).unwrap().0;
        }
        manager.seal(&key).unwrap();
        let root = manager.load(&key).unwrap().unwrap().build_tree().unwrap().root();
        let err = manager
            .add_proof(relay_leaf(&servicer.public_key(), 40))
            .unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::Sealed(_))));
        let again = manager.load(&key).unwrap().unwrap().build_tree().unwrap().root();
        assert_eq!(root, again);
        // tree order, not arrival order
        let first = manager.get_proof(&key, 0).unwrap();
        assert_eq!(first.entropy(), 10);
    }

    #[test]
    fn test_delete_removes_leaves() {
        let (servicer, manager) = manager();
        let (key, _) = manager.add_proof(relay_leaf(&servicer.public_key(), 1)).unwrap();
        manager.seal(&key).unwrap();
        manager.delete(&key).unwrap();
        assert!(manager.load(&key).unwrap().is_none());
        assert!(!manager.is_sealed(&key));
        assert!(manager.list().unwrap().is_empty());
        // a fresh object can reuse the key
        manager.add_proof(relay_leaf(&servicer.public_key(), 1)).unwrap();
    }

    #[test]
    fn test_concurrent_appends_serialize() {
        let (servicer, manager) = manager();
        let manager = Arc::new(manager);
        let pk = servicer.public_key();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for i in 0..10i64 {
                        manager.add_proof(relay_leaf(&pk, t * 100 + i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let (key, meta) = manager.list().unwrap().remove(0);
        assert_eq!(meta.leaf_count, 80);
        assert_eq!(manager.load(&key).unwrap().unwrap().proofs.len(), 80);
    }
}
