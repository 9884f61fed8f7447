//! Deterministic session derivation.
//!
//! A session is fixed by its header and the block hash at the session
//! height: servicers are ranked by `SHA3(pubkey) XOR session_key` and the
//! closest `num_servicers` are selected.

use log::{debug, info};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::crypto::{sha3_256, sha3_256_concat, Hash};
use crate::error::{Error, Result};
use crate::registry::RegistryView;
use crate::storage::{Cache, Storage};
use crate::types::{DispatchResponse, Params, ServicerInfo, Session, SessionHeader, SessionServicer};

pub const SESSION_CACHE_PREFIX: &str = "session/";

/// `SHA3-256(requestor_pub_key || block_hash || chain || geo_zone)`
pub fn session_key(header: &SessionHeader, block_hash: &Hash) -> Hash {
    sha3_256_concat(&[
        header.requestor_pub_key.as_bytes(),
        block_hash.as_bytes(),
        header.chain.as_bytes(),
        header.geo_zone.as_bytes(),
    ])
}

fn distance(candidate: &ServicerInfo, key: &Hash) -> [u8; 32] {
    let digest = sha3_256(candidate.public_key.as_bytes());
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = digest.0[i] ^ key.0[i];
    }
    out
}

/// Picks the `n` candidates closest to `key`; ties go to the smaller
/// public key.
pub fn select_servicers(key: &Hash, candidates: &[ServicerInfo], n: u32) -> Result<Vec<SessionServicer>> {
    let required = n as usize;
    if candidates.len() < required {
        return Err(Error::InsufficientServicers {
            required: n,
            available: candidates.len(),
        });
    }
    let mut ranked: Vec<([u8; 32], &ServicerInfo)> =
        candidates.iter().map(|c| (distance(c, key), c)).collect();
    // big-endian byte order is numeric order for 256-bit integers
    ranked.sort_by(|(da, a), (db, b)| match da.cmp(db) {
        Ordering::Equal => a.public_key.cmp(&b.public_key),
        other => other,
    });
    ranked.dedup_by(|(_, a), (_, b)| a.public_key == b.public_key);
    if ranked.len() < required {
        return Err(Error::InsufficientServicers {
            required: n,
            available: ranked.len(),
        });
    }
    Ok(ranked
        .into_iter()
        .take(required)
        .map(|(_, s)| SessionServicer {
            address: s.address,
            public_key: s.public_key,
            service_url: s.service_url.clone(),
        })
        .collect())
}

pub fn derive_session(header: &SessionHeader, block_hash: Hash, candidates: &[ServicerInfo]) -> Result<Session> {
    let key = session_key(header, &block_hash);
    let servicers = select_servicers(&key, candidates, header.num_servicers)?;
    Ok(Session {
        session_key: key,
        header: header.clone(),
        block_hash,
        servicers,
    })
}

/// Reads the block hash and candidate set from the registry and derives
/// the session, without caching.
pub fn derive_from_registry(registry: &dyn RegistryView, header: &SessionHeader) -> Result<Session> {
    let block_hash = registry.block_hash(header.session_block_height)?;
    let candidates =
        registry.validators_for(&header.chain, &header.geo_zone, header.session_block_height)?;
    derive_session(header, block_hash, &candidates)
}

/// Validates a dispatch header and derives the session at the latest
/// session height not above `current_height`.
pub fn dispatch(registry: &dyn RegistryView, header: &SessionHeader, current_height: i64) -> Result<DispatchResponse> {
    header.validate_basic()?;
    let params = registry.get_params(current_height)?;
    if !params.supports_chain(&header.chain) {
        return Err(Error::UnsupportedChain(header.chain.clone()));
    }
    if !params.supports_geo_zone(&header.geo_zone) {
        return Err(Error::UnsupportedGeoZone(header.geo_zone.clone()));
    }
    if header.session_block_height > current_height {
        return Err(Error::InvalidBlockHeight(format!(
            "session height {} is ahead of current height {}",
            header.session_block_height, current_height
        )));
    }
    if !params.is_session_aligned(header.session_block_height) {
        return Err(Error::InvalidBlockHeight(format!(
            "session height {} is not aligned to frequency {}",
            header.session_block_height, params.session_block_frequency
        )));
    }

    let mut normalized = header.clone();
    normalized.session_block_height = params.session_start(current_height);
    let session = derive_from_registry(registry, &normalized)?;
    Ok(DispatchResponse {
        session,
        block_height: current_height,
    })
}

/// Memoized sessions for one servicer identity, keyed by session key.
pub struct SessionCache {
    cache: Cache<Session>,
}

impl SessionCache {
    pub fn open(store: Arc<dyn Storage>, identity: &str, capacity: usize) -> Result<Self> {
        let prefix = format!("{}{}/", SESSION_CACHE_PREFIX, identity);
        Ok(Self {
            cache: Cache::open(store, prefix, capacity)?,
        })
    }

    pub fn cache(&self) -> &Cache<Session> {
        &self.cache
    }

    pub fn get_or_derive(&self, registry: &dyn RegistryView, header: &SessionHeader) -> Result<Session> {
        let block_hash = registry.block_hash(header.session_block_height)?;
        let key = session_key(header, &block_hash).to_hex();
        if let Some(session) = self.cache.get(&key)? {
            if session.header == *header {
                return Ok(session);
            }
        }
        let candidates =
            registry.validators_for(&header.chain, &header.geo_zone, header.session_block_height)?;
        let session = derive_session(header, block_hash, &candidates)?;
        debug!(
            "derived session {} for chain {} at {}",
            key, header.chain, header.session_block_height
        );
        self.cache.set(&key, session.clone())?;
        Ok(session)
    }

    /// Drops sessions whose claim windows have fully closed.
    pub fn evict_expired(&self, current_height: i64, params: &Params) -> Result<usize> {
        let mut evicted = 0;
        for (key, session) in self.cache.iter()? {
            if current_height > params.session_expiry(session.header.session_block_height) {
                self.cache.delete(&key)?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!("evicted {} expired sessions at height {}", evicted, current_height);
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Address, PrivateKey, PublicKey};
    use crate::registry::{ChainState, MemoryRegistry};
    use crate::storage::MemoryStorage;
    use proptest::prelude::*;

    fn servicer(seed: u8) -> ServicerInfo {
        let key = PrivateKey::from_seed([seed; 32]);
        ServicerInfo {
            address: key.address(),
            public_key: key.public_key(),
            service_url: format!("http://servicer-{}", seed),
            chains: vec!["0001".into()],
            geo_zones: vec!["0001".into()],
            staked_tokens: 1000,
            jailed: false,
        }
    }

    fn header(num_servicers: u32, height: i64) -> SessionHeader {
        SessionHeader {
            requestor_pub_key: PrivateKey::from_seed([99u8; 32]).public_key(),
            chain: "0001".into(),
            geo_zone: "0001".into(),
            session_block_height: height,
            num_servicers,
        }
    }

    fn registry(servicers: &[ServicerInfo], height: i64) -> MemoryRegistry {
        let mut state = ChainState {
            height: 1,
            block_hash: sha3_256(b"genesis"),
            ..ChainState::default()
        };
        state.params.supported_blockchains = vec!["0001".into()];
        state.params.supported_geo_zones = vec!["0001".into()];
        for s in servicers {
            state.add_servicer(s.clone());
        }
        let registry = MemoryRegistry::new(state.clone());
        for h in 2..=height {
            state.height = h;
            state.block_hash = sha3_256(&h.to_be_bytes());
            registry.commit(state.clone()).unwrap();
        }
        registry
    }

    #[test]
    fn test_selects_closest_by_xor() {
        let candidates: Vec<ServicerInfo> = (1..=8).map(servicer).collect();
        let key = sha3_256(b"session");
        let selected = select_servicers(&key, &candidates, 3).unwrap();
        assert_eq!(selected.len(), 3);

        let mut by_distance: Vec<_> = candidates.iter().map(|c| (distance(c, &key), c.public_key)).collect();
        by_distance.sort();
        let expected: Vec<PublicKey> = by_distance.iter().take(3).map(|(_, k)| *k).collect();
        let actual: Vec<PublicKey> = selected.iter().map(|s| s.public_key).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_insufficient_servicers() {
        let candidates: Vec<ServicerInfo> = (1..=2).map(servicer).collect();
        assert!(matches!(
            select_servicers(&Hash::ZERO, &candidates, 5),
            Err(Error::InsufficientServicers { required: 5, available: 2 })
        ));
    }

    #[test]
    fn test_duplicate_candidates_counted_once() {
        let candidates = vec![servicer(1), servicer(1)];
        assert!(select_servicers(&Hash::ZERO, &candidates, 2).is_err());
    }

    #[test]
    fn test_dispatch_normalizes_to_current_session() {
        let servicers: Vec<ServicerInfo> = (1..=5).map(servicer).collect();
        let registry = registry(&servicers, 7);
        let resp = dispatch(&registry, &header(5, 1), 7).unwrap();
        assert_eq!(resp.session.header.session_block_height, 5);
        assert_eq!(resp.session.servicers.len(), 5);
        assert_eq!(resp.block_height, 7);
    }

    #[test]
    fn test_dispatch_rejects_bad_headers() {
        let servicers: Vec<ServicerInfo> = (1..=5).map(servicer).collect();
        let registry = registry(&servicers, 7);
        assert!(matches!(
            dispatch(&registry, &header(5, 2), 7),
            Err(Error::InvalidBlockHeight(_))
        ));
        assert!(matches!(
            dispatch(&registry, &header(5, 9), 7),
            Err(Error::InvalidBlockHeight(_))
        ));
        let mut h = header(5, 1);
        h.chain = "0002".into();
        assert!(matches!(dispatch(&registry, &h, 7), Err(Error::UnsupportedChain(_))));
        let mut h = header(5, 1);
        h.geo_zone = "0009".into();
        assert!(matches!(dispatch(&registry, &h, 7), Err(Error::UnsupportedGeoZone(_))));
    }

    #[test]
    fn test_cache_memoizes_and_evicts() {
        let servicers: Vec<ServicerInfo> = (1..=5).map(servicer).collect();
        let registry = registry(&servicers, 5);
        let cache = SessionCache::open(Arc::new(MemoryStorage::new()), "node", 16).unwrap();
        let first = cache.get_or_derive(&registry, &header(5, 1)).unwrap();
        let second = cache.get_or_derive(&registry, &header(5, 1)).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.cache().cached_len(), 1);

        let params = Params::default();
        assert_eq!(cache.evict_expired(params.session_expiry(1), &params).unwrap(), 0);
        assert_eq!(cache.evict_expired(params.session_expiry(1) + 1, &params).unwrap(), 1);
    }

    #[test]
    fn test_jailed_servicers_not_candidates() {
        let mut servicers: Vec<ServicerInfo> = (1..=5).map(servicer).collect();
        servicers[0].jailed = true;
        let registry = registry(&servicers, 1);
        assert!(derive_from_registry(&registry, &header(5, 1)).is_err());
        let session = derive_from_registry(&registry, &header(4, 1)).unwrap();
        assert!(!session.contains(&servicers[0].public_key));
    }

    proptest! {
        #[test]
        fn session_is_deterministic(seeds in prop::collection::btree_set(1u8..120, 5..12), bh in any::<[u8; 32]>()) {
            let candidates: Vec<ServicerInfo> = seeds.iter().map(|&s| servicer(s)).collect();
            let mut reversed = candidates.clone();
            reversed.reverse();
            let h = header(5, 1);
            let a = derive_session(&h, Hash(bh), &candidates).unwrap();
            let b = derive_session(&h, Hash(bh), &reversed).unwrap();
            prop_assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
            let addresses: Vec<Address> = a.servicers.iter().map(|s| s.address).collect();
            prop_assert_eq!(addresses.len(), 5);
        }
    }
}
