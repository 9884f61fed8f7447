//! Single-process chain for devnets and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::crypto::{sha3_256_concat, Address, Hash};
use crate::error::{Error, Result, TxRejectCode};
use crate::protocol::{ChainIo, StdTx, TxCodec, TxMsg, TxStatus};
use crate::registry::{ChainState, MemoryRegistry, RegistryView};
use crate::types::{Claim, EvidenceKind, Params, RequestorInfo, ServicerInfo, SessionHeader};

use super::keeper;

pub const DEFAULT_MEMPOOL_CAPACITY: usize = 5000;

/// Genesis file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisDoc {
    pub params: Params,
    pub servicers: Vec<ServicerInfo>,
    pub requestors: Vec<RequestorInfo>,
    pub balances: BTreeMap<Address, u64>,
}

impl GenesisDoc {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading genesis {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// State at height 0.
    pub fn into_state(self) -> ChainState {
        let mut state = ChainState {
            params: self.params,
            balances: self.balances,
            block_hash: LocalChain::block_hash_for(&Hash::ZERO, 0),
            ..ChainState::default()
        };
        for servicer in self.servicers {
            state.add_servicer(servicer);
        }
        for requestor in self.requestors {
            state.add_requestor(requestor);
        }
        state
    }
}

/// Copy-on-commit chain with a mempool. Implements both sides the node
/// needs: `RegistryView` for reads and `ChainIo` for submissions.
pub struct LocalChain {
    registry: MemoryRegistry,
    codec: TxCodec,
    network_id: String,
    /// Encoded transactions awaiting the next block
    mempool: Mutex<Vec<(Hash, Vec<u8>)>>,
    mempool_capacity: usize,
    /// Latest status of each submitted transaction, with the height it was set at
    statuses: DashMap<Hash, (i64, TxStatus)>,
}

impl LocalChain {
    pub fn new(genesis: ChainState, codec: TxCodec, network_id: impl Into<String>) -> Self {
        Self {
            registry: MemoryRegistry::new(genesis),
            codec,
            network_id: network_id.into(),
            mempool: Mutex::new(Vec::new()),
            mempool_capacity: DEFAULT_MEMPOOL_CAPACITY,
            statuses: DashMap::new(),
        }
    }

    pub fn with_mempool_capacity(mut self, capacity: usize) -> Self {
        self.mempool_capacity = capacity;
        self
    }

    /// `SHA3-256(prev_hash || be_i64(height))`
    pub fn block_hash_for(prev: &Hash, height: i64) -> Hash {
        sha3_256_concat(&[prev.as_bytes(), &height.to_be_bytes()])
    }

    pub fn registry(&self) -> &MemoryRegistry {
        &self.registry
    }

    pub fn latest_state(&self) -> Arc<ChainState> {
        self.registry.latest()
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.lock().len()
    }

    pub fn commit_block(&self) -> Result<i64> {
        self.commit_block_with(|_| {})
    }

    /// Builds and commits the next block. `prepare` may edit the new state
    /// (stake changes and the like) before queued transactions execute.
    pub fn commit_block_with(&self, prepare: impl FnOnce(&mut ChainState)) -> Result<i64> {
        let mut mempool = self.mempool.lock();
        let parent = self.registry.latest();
        let height = parent.height + 1;
        let mut state = (*parent).clone();
        state.height = height;
        state.block_hash = Self::block_hash_for(&parent.block_hash, height);
        prepare(&mut state);

        let txs = std::mem::take(&mut *mempool);
        let mut results = Vec::with_capacity(txs.len());
        for (hash, bytes) in txs {
            let status = match self.execute(&mut state, &bytes, height) {
                Ok(()) => TxStatus::Committed { height },
                Err(e) => {
                    debug!("tx {} failed in block {}: {}", hash, height, e);
                    TxStatus::Rejected {
                        code: reject_code(&e),
                        reason: e.to_string(),
                    }
                }
            };
            results.push((hash, status));
        }
        keeper::prune_expired_claims(&mut state, height);
        let horizon = state.params.history_horizon(height);
        self.registry.commit(state)?;
        for (hash, status) in results {
            self.statuses.insert(hash, (height, status));
        }
        let pruned = self.prune_history(horizon);
        debug!("committed block {} (pruned {} old entries)", height, pruned);
        Ok(height)
    }

    /// Drops snapshots and settled transaction statuses below `horizon`.
    /// Pending transactions are kept until they execute.
    pub fn prune_history(&self, horizon: i64) -> usize {
        let snapshots = self.registry.prune_below(horizon);
        let before = self.statuses.len();
        self.statuses
            .retain(|_, (height, status)| *height >= horizon || *status == TxStatus::Pending);
        snapshots + before - self.statuses.len()
    }

    pub fn status_count(&self) -> usize {
        self.statuses.len()
    }

    fn execute(&self, state: &mut ChainState, bytes: &[u8], height: i64) -> Result<()> {
        let tx = self.codec.decode(bytes, height)?;
        tx.verify(&self.network_id)
            .map_err(|e| Error::tx_rejected(TxRejectCode::InvalidSignature, e.to_string()))?;
        let signer = tx.signer();
        if !state.debit(&signer, tx.fee) {
            return Err(Error::tx_rejected(
                TxRejectCode::InsufficientFunds,
                format!("{} cannot pay fee {}", signer, tx.fee),
            ));
        }
        match &tx.msg {
            TxMsg::Claim(msg) => keeper::apply_claim(state, &self.registry, &signer, msg, height),
            TxMsg::Proof(msg) => {
                let outcome = keeper::apply_proof(state, &self.registry, &signer, msg, height)?;
                info!("proof by {} at {}: {:?}", signer, height, outcome);
                Ok(())
            }
        }
    }
}

fn reject_code(e: &Error) -> TxRejectCode {
    match e {
        Error::TxRejected { code, .. } => *code,
        Error::Crypto(_) => TxRejectCode::InvalidSignature,
        _ => TxRejectCode::Invalid,
    }
}

#[async_trait]
impl ChainIo for LocalChain {
    async fn submit_tx(&self, tx: StdTx) -> Result<Hash> {
        tx.verify(&self.network_id)
            .map_err(|e| Error::tx_rejected(TxRejectCode::InvalidSignature, e.to_string()))?;
        let hash = tx.hash()?;
        let mut mempool = self.mempool.lock();
        if self.statuses.contains_key(&hash) {
            return Ok(hash);
        }
        let state = self.registry.latest();
        if state.balance(&tx.signer()) < tx.fee {
            return Err(Error::tx_rejected(
                TxRejectCode::InsufficientFunds,
                format!("{} cannot pay fee {}", tx.signer(), tx.fee),
            ));
        }
        if mempool.len() >= self.mempool_capacity {
            return Err(Error::tx_rejected(TxRejectCode::Mempool, "mempool is full"));
        }
        let bytes = self.codec.encode(&tx, state.height + 1)?;
        mempool.push((hash, bytes));
        self.statuses.insert(hash, (state.height, TxStatus::Pending));
        Ok(hash)
    }

    async fn tx_status(&self, hash: &Hash) -> Result<TxStatus> {
        Ok(self
            .statuses
            .get(hash)
            .map(|entry| entry.1.clone())
            .unwrap_or(TxStatus::Unknown))
    }
}

impl RegistryView for LocalChain {
    fn latest_height(&self) -> i64 {
        self.registry.latest_height()
    }

    fn block_hash(&self, height: i64) -> Result<Hash> {
        self.registry.block_hash(height)
    }

    fn get_params(&self, height: i64) -> Result<Params> {
        self.registry.get_params(height)
    }

    fn validators_for(&self, chain: &str, geo_zone: &str, height: i64) -> Result<Vec<ServicerInfo>> {
        self.registry.validators_for(chain, geo_zone, height)
    }

    fn servicer(&self, address: &Address, height: i64) -> Result<Option<ServicerInfo>> {
        self.registry.servicer(address, height)
    }

    fn requestor(&self, address: &Address, height: i64) -> Result<Option<RequestorInfo>> {
        self.registry.requestor(address, height)
    }

    fn get_claim(
        &self,
        address: &Address,
        header: &SessionHeader,
        kind: EvidenceKind,
        height: i64,
    ) -> Result<Option<Claim>> {
        self.registry.get_claim(address, header, kind, height)
    }

    fn get_all_claims(&self, address: &Address, height: i64) -> Result<Vec<Claim>> {
        self.registry.get_all_claims(address, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha3_256, PrivateKey};
    use crate::merkle::{HashRange, Range};
    use crate::types::MsgClaim;

    fn chain(balance: u64) -> (PrivateKey, LocalChain) {
        let key = PrivateKey::from_seed([41u8; 32]);
        let mut genesis = GenesisDoc::default();
        genesis.balances.insert(key.address(), balance);
        (key, LocalChain::new(genesis.into_state(), TxCodec::new(3), "relaynet"))
    }

    fn claim_tx(key: &PrivateKey, fee: u64) -> StdTx {
        let msg = TxMsg::Claim(MsgClaim {
            session_header: SessionHeader {
                requestor_pub_key: key.public_key(),
                chain: "0001".into(),
                geo_zone: "0001".into(),
                session_block_height: 1,
                num_servicers: 1,
            },
            merkle_root: HashRange {
                hash: sha3_256(b"root"),
                range: Range { lower: 0, upper: 10 },
            },
            total_proofs: 5,
            from_address: key.address(),
            evidence_kind: EvidenceKind::Relay,
            expiration_height: 0,
        });
        StdTx::new_signed(key, "relaynet", msg, fee, "").unwrap()
    }

    #[test]
    fn test_block_hashes_chain() {
        let (_, chain) = chain(0);
        let genesis = chain.block_hash(0).unwrap();
        assert_eq!(chain.commit_block().unwrap(), 1);
        assert_eq!(chain.block_hash(1).unwrap(), LocalChain::block_hash_for(&genesis, 1));
        assert!(chain.block_hash(2).is_err());
    }

    #[tokio::test]
    async fn test_submission_checks() {
        let (key, chain) = chain(100);
        let poor = claim_tx(&key, 1_000);
        assert!(matches!(
            chain.submit_tx(poor).await,
            Err(Error::TxRejected { code: TxRejectCode::InsufficientFunds, .. })
        ));

        let mut forged = claim_tx(&key, 10);
        forged.fee = 0;
        assert!(matches!(
            chain.submit_tx(forged).await,
            Err(Error::TxRejected { code: TxRejectCode::InvalidSignature, .. })
        ));

        let chain = chain.with_mempool_capacity(1);
        chain.submit_tx(claim_tx(&key, 10)).await.unwrap();
        let err = chain.submit_tx(claim_tx(&key, 10)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_failed_tx_still_pays_fee() {
        let (key, chain) = chain(100);
        // no servicers staked: the claim fails on chain across the codec switch
        chain.commit_block().unwrap();
        let hash = chain.submit_tx(claim_tx(&key, 10)).await.unwrap();
        assert_eq!(chain.tx_status(&hash).await.unwrap(), TxStatus::Pending);
        let height = chain.commit_block().unwrap();
        assert!(matches!(
            chain.tx_status(&hash).await.unwrap(),
            TxStatus::Rejected { .. }
        ));
        assert_eq!(chain.latest_state().balance(&key.address()), 90);
        assert_eq!(height, 2);
        assert_eq!(chain.mempool_len(), 0);
        assert_eq!(chain.tx_status(&sha3_256(b"nothing")).await.unwrap(), TxStatus::Unknown);
    }

    #[tokio::test]
    async fn test_history_is_pruned_past_the_horizon() {
        let (key, chain) = chain(100);
        let params = chain.get_params(0).unwrap();
        let settled = chain.submit_tx(claim_tx(&key, 10)).await.unwrap();
        chain.commit_block().unwrap();

        // last height at which block 1 is still within reach of a late proof
        let reach = 1 - params.history_horizon(0);
        while chain.latest_height() < reach {
            chain.commit_block().unwrap();
        }
        assert!(chain.block_hash(0).is_err());
        assert!(chain.block_hash(1).is_ok());
        assert!(matches!(chain.tx_status(&settled).await.unwrap(), TxStatus::Rejected { .. }));

        let recent = chain.submit_tx(claim_tx(&key, 5)).await.unwrap();
        chain.commit_block().unwrap();
        assert!(chain.block_hash(1).is_err());
        assert!(chain.block_hash(2).is_ok());
        assert_eq!(chain.tx_status(&settled).await.unwrap(), TxStatus::Unknown);
        assert!(matches!(chain.tx_status(&recent).await.unwrap(), TxStatus::Rejected { .. }));
        assert_eq!(chain.status_count(), 1);
    }
}
