//! The protocol actor. It wakes on every committed block and moves each
//! evidence object one or more steps along
//! `Accumulating → ReadyToClaim → ClaimPending → WaitingForProof →
//! ProofPending → Finalized`, or to `Expired` when a window is missed.
//!
//! Per-evidence state is written through to the store after every step,
//! so a restart resumes where it stopped instead of resubmitting.

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::{Hash, PublicKey};
use crate::engine::{Engine, Identity};
use crate::error::{Error, Result, TxRejectCode};
use crate::evidence::Evidence;
use crate::merkle::{target_index, HashRange, MerkleProof};
use crate::session::session_key;
use crate::storage::{Cache, Flushable};
use crate::types::{Claim, EvidenceKind, EvidenceLeaf, MsgClaim, MsgProof, Params};

use super::chain_io::{ChainIo, TxStatus};
use super::codec::{StdTx, TxMsg};
use super::record::{ClaimRecord, ClaimState, CLAIM_RECORD_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerMsg {
    BlockCommitted(i64),
    /// An evidence object gained a leaf
    RelayAccepted { servicer: PublicKey, key: Hash },
    Shutdown,
}

/// Sending side of a running handler.
pub struct HandlerHandle {
    sender: mpsc::UnboundedSender<HandlerMsg>,
    task: JoinHandle<()>,
}

impl HandlerHandle {
    pub fn sender(&self) -> mpsc::UnboundedSender<HandlerMsg> {
        self.sender.clone()
    }

    pub fn block_committed(&self, height: i64) {
        if self.sender.send(HandlerMsg::BlockCommitted(height)).is_err() {
            debug!("protocol handler stopped; block {} not delivered", height);
        }
    }

    /// Asks the handler to stop after the messages already queued and
    /// waits for it.
    pub async fn shutdown(self) {
        let _ = self.sender.send(HandlerMsg::Shutdown);
        if let Err(e) = self.task.await {
            error!("protocol handler task failed: {}", e);
        }
    }
}

pub struct ProtocolHandler {
    engine: Arc<Engine>,
    chain: Arc<dyn ChainIo>,
    records: BTreeMap<PublicKey, Cache<ClaimRecord>>,
    retry_attempts: u32,
    retry_base: Duration,
}

impl ProtocolHandler {
    pub fn new(engine: Arc<Engine>, chain: Arc<dyn ChainIo>) -> Result<Self> {
        let capacity = engine.config().evidence_cache_capacity;
        let mut records = BTreeMap::new();
        for identity in engine.identities() {
            let prefix = format!("{}{}/", CLAIM_RECORD_PREFIX, identity.address());
            records.insert(
                *identity.public_key(),
                Cache::open(engine.store().clone(), prefix, capacity)?,
            );
        }
        let retry_attempts = engine.config().claim_retry_attempts.max(1);
        let retry_base = Duration::from_millis(engine.config().claim_retry_base_ms);
        Ok(Self {
            engine,
            chain,
            records,
            retry_attempts,
            retry_base,
        })
    }

    fn records_for(&self, servicer: &PublicKey) -> Result<&Cache<ClaimRecord>> {
        self.records
            .get(servicer)
            .ok_or_else(|| Error::UnknownServicer(servicer.to_hex()))
    }

    pub fn record(&self, servicer: &PublicKey, key: &Hash) -> Result<Option<ClaimRecord>> {
        Ok(self.records_for(servicer)?.get(&key.to_hex())?)
    }

    pub fn records(&self, servicer: &PublicKey) -> Result<Vec<ClaimRecord>> {
        Ok(self
            .records_for(servicer)?
            .iter()?
            .map(|(_, record)| record)
            .collect())
    }

    /// Attaches to the engine and runs the actor on the current runtime.
    pub fn spawn(self) -> Result<HandlerHandle> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.engine.attach_handler(sender.clone())?;
        let task = tokio::spawn(self.run(receiver));
        Ok(HandlerHandle { sender, task })
    }

    pub async fn run(self, mut receiver: mpsc::UnboundedReceiver<HandlerMsg>) {
        while let Some(msg) = receiver.recv().await {
            match msg {
                HandlerMsg::BlockCommitted(height) => {
                    if let Err(e) = self.process_block(height).await {
                        error!("processing block {} failed: {}", height, e);
                    }
                }
                HandlerMsg::RelayAccepted { servicer, key } => {
                    if let Err(e) = self.note_evidence(&servicer, &key) {
                        warn!("tracking evidence {}: {}", key, e);
                    }
                }
                HandlerMsg::Shutdown => break,
            }
        }
        for records in self.records.values() {
            if let Err(e) = records.flush_all() {
                error!("flushing claim records {}: {}", records.name(), e);
            }
        }
        info!("protocol handler stopped");
    }

    fn note_evidence(&self, servicer: &PublicKey, key: &Hash) -> Result<()> {
        let records = self.records_for(servicer)?;
        let key_hex = key.to_hex();
        if records.contains(&key_hex)? {
            return Ok(());
        }
        let identity = self
            .engine
            .identity(servicer)
            .ok_or_else(|| Error::UnknownServicer(servicer.to_hex()))?;
        if let Some(meta) = identity.evidence.get(key)? {
            records.set_and_flush(
                &key_hex,
                ClaimRecord::new(*key, meta.session_header, meta.evidence_kind),
            )?;
        }
        Ok(())
    }

    /// Startup reconciliation. Sealed evidence without a record was being
    /// claimed when the process stopped; the chain's claim registry decides
    /// which state it re-enters. Returns the number reconciled.
    pub fn recover(&self) -> Result<usize> {
        let registry = self.engine.registry();
        let height = registry.latest_height();
        let mut reconciled = 0;
        for identity in self.engine.identities() {
            let records = self.records_for(identity.public_key())?;
            for (key, meta) in identity.evidence.list()? {
                let key_hex = key.to_hex();
                if records.contains(&key_hex)? {
                    continue;
                }
                let mut record = ClaimRecord::new(key, meta.session_header.clone(), meta.evidence_kind);
                if meta.sealed {
                    match registry.get_claim(&identity.address(), &meta.session_header, meta.evidence_kind, height)? {
                        Some(claim) => adopt_claim(&mut record, &claim),
                        None => record.transition(ClaimState::ReadyToClaim),
                    }
                    info!("recovered evidence {} into {}", key_hex, record.state);
                    reconciled += 1;
                }
                records.set_and_flush(&key_hex, record)?;
            }
            for (key_hex, record) in records.iter()? {
                if identity.evidence.get(&record.evidence_key)?.is_none() {
                    debug!("dropping claim record {} without evidence", key_hex);
                    records.delete(&key_hex)?;
                }
            }
        }
        Ok(reconciled)
    }

    /// Drives every evidence object of every hosted identity as far as
    /// `height` allows.
    pub async fn process_block(&self, height: i64) -> Result<()> {
        let params = self.engine.registry().get_params(height)?;
        for identity in self.engine.identities() {
            let records = self.records_for(identity.public_key())?;
            for (key, meta) in identity.evidence.list()? {
                let key_hex = key.to_hex();
                if !records.contains(&key_hex)? {
                    records.set_and_flush(
                        &key_hex,
                        ClaimRecord::new(key, meta.session_header, meta.evidence_kind),
                    )?;
                }
            }
            for (key_hex, record) in records.iter()? {
                if let Err(e) = self.drive(identity, records, record, height, &params).await {
                    warn!("evidence {} of {}: {}", key_hex, identity.address(), e);
                }
            }
        }
        if let Err(e) = self.engine.evict_expired(height) {
            warn!("evicting expired sessions at {}: {}", height, e);
        }
        Ok(())
    }

    async fn drive(
        &self,
        identity: &Identity,
        records: &Cache<ClaimRecord>,
        mut record: ClaimRecord,
        height: i64,
        params: &Params,
    ) -> Result<()> {
        let key_hex = record.evidence_key.to_hex();
        loop {
            let before = record.clone();
            let outcome = self.advance(identity, &mut record, height, params).await;
            if record != before {
                records.set_and_flush(&key_hex, record.clone())?;
            }
            outcome?;
            if record.state != before.state {
                info!(
                    "evidence {} for session {}: {} -> {}",
                    key_hex, record.session_header.session_block_height, before.state, record.state
                );
            }
            if record.state.is_terminal() {
                identity.evidence.delete(&record.evidence_key)?;
                records.delete(&key_hex)?;
                return Ok(());
            }
            if record.state == before.state {
                return Ok(());
            }
        }
    }

    async fn advance(&self, identity: &Identity, record: &mut ClaimRecord, height: i64, params: &Params) -> Result<()> {
        let registry = self.engine.registry();
        let header = record.session_header.clone();
        let kind = record.evidence_kind;
        let session_height = header.session_block_height;

        if let Some(expiration) = record.expiration_height {
            if height > expiration && !record.state.is_terminal() {
                error!(
                    "claim for evidence {} expired at {}; discarding {} proofs",
                    record.evidence_key, expiration, record.total_proofs
                );
                record.transition(ClaimState::Expired);
                return Ok(());
            }
        }

        match record.state {
            ClaimState::Accumulating => {
                if height < params.session_end(session_height) {
                    return Ok(());
                }
                let Some(meta) = identity.evidence.get(&record.evidence_key)? else {
                    record.transition(ClaimState::Expired);
                    return Ok(());
                };
                let minimum = match kind {
                    EvidenceKind::Relay => params.minimum_number_of_proofs,
                    EvidenceKind::Challenge => 1,
                };
                if meta.leaf_count < minimum {
                    info!(
                        "evidence {} holds {} of {} required proofs; discarding",
                        record.evidence_key, meta.leaf_count, minimum
                    );
                    record.transition(ClaimState::Expired);
                } else {
                    record.total_proofs = meta.leaf_count;
                    record.transition(ClaimState::ReadyToClaim);
                }
            }

            ClaimState::ReadyToClaim => {
                if let Some(claim) = registry.get_claim(&identity.address(), &header, kind, registry.latest_height())? {
                    adopt_claim(record, &claim);
                    return Ok(());
                }
                if height > params.claim_deadline(session_height) {
                    error!(
                        "claim window for session {} closed at {}; discarding evidence {}",
                        session_height,
                        params.claim_deadline(session_height),
                        record.evidence_key
                    );
                    record.transition(ClaimState::Expired);
                    return Ok(());
                }
                identity.evidence.seal(&record.evidence_key)?;
                let evidence = self.load_evidence(identity, &record.evidence_key)?;
                let total_proofs = evidence.meta.leaf_count;
                let root = build_root(evidence).await?;
                let msg = MsgClaim {
                    session_header: header,
                    merkle_root: root,
                    total_proofs,
                    from_address: identity.address(),
                    evidence_kind: kind,
                    expiration_height: height + params.claim_expiration_blocks(),
                };
                match self.submit(identity, TxMsg::Claim(msg)).await {
                    Ok(tx) => {
                        info!(
                            "submitted claim {} for evidence {} ({} proofs)",
                            tx, record.evidence_key, total_proofs
                        );
                        record.root = Some(root);
                        record.total_proofs = total_proofs;
                        record.claim_tx = Some(tx);
                        record.transition(ClaimState::ClaimPending);
                    }
                    Err(e) => on_submit_error(record, "claim", e),
                }
            }

            ClaimState::ClaimPending => {
                let Some(tx) = record.claim_tx else {
                    record.transition(ClaimState::ReadyToClaim);
                    return Ok(());
                };
                let on_chain = || registry.get_claim(&identity.address(), &header, kind, registry.latest_height());
                match self.chain.tx_status(&tx).await? {
                    TxStatus::Pending => {}
                    TxStatus::Committed { height: committed } => match on_chain()? {
                        Some(claim) => adopt_claim(record, &claim),
                        None => {
                            record.claim_commit_height = Some(committed);
                            record.expiration_height = Some(committed + params.claim_expiration_blocks());
                            record.transition(ClaimState::WaitingForProof);
                        }
                    },
                    TxStatus::Rejected { code, reason } => {
                        if let Some(claim) = on_chain()? {
                            adopt_claim(record, &claim);
                        } else if code == TxRejectCode::Mempool {
                            warn!("claim {} dropped by the mempool ({}); resubmitting", tx, reason);
                            record.transition(ClaimState::ReadyToClaim);
                        } else {
                            error!("claim {} rejected ({:?}: {}); discarding evidence", tx, code, reason);
                            record.transition(ClaimState::Expired);
                        }
                    }
                    TxStatus::Unknown => match on_chain()? {
                        Some(claim) => adopt_claim(record, &claim),
                        None => {
                            warn!("claim {} unknown to the chain; resubmitting", tx);
                            record.transition(ClaimState::ReadyToClaim);
                        }
                    },
                }
            }

            ClaimState::WaitingForProof => {
                let Some(commit_height) = record.claim_commit_height else {
                    record.transition(ClaimState::ReadyToClaim);
                    return Ok(());
                };
                let reveal = params.reveal_height(commit_height);
                if height < reveal {
                    return Ok(());
                }
                let reveal_hash = registry.block_hash(reveal)?;
                let key = session_key(&header, &registry.block_hash(session_height)?);
                let index = target_index(&reveal_hash, &key, record.total_proofs)?;
                let evidence = self.load_evidence(identity, &record.evidence_key)?;
                let (root, merkle_proof, leaf) = reveal_leaf(evidence, index).await?;
                if record.root.is_some_and(|claimed| claimed != root) {
                    error!("evidence {} no longer matches its claimed root; discarding", record.evidence_key);
                    record.transition(ClaimState::Expired);
                    return Ok(());
                }
                let msg = MsgProof {
                    merkle_proof,
                    leaf,
                    evidence_kind: kind,
                };
                match self.submit(identity, TxMsg::Proof(msg)).await {
                    Ok(tx) => {
                        info!(
                            "submitted proof {} for evidence {} (leaf {} of {})",
                            tx, record.evidence_key, index, record.total_proofs
                        );
                        record.proof_tx = Some(tx);
                        record.transition(ClaimState::ProofPending);
                    }
                    Err(e) => on_submit_error(record, "proof", e),
                }
            }

            ClaimState::ProofPending => {
                let Some(tx) = record.proof_tx else {
                    record.transition(ClaimState::WaitingForProof);
                    return Ok(());
                };
                match self.chain.tx_status(&tx).await? {
                    TxStatus::Pending => {}
                    TxStatus::Committed { height: committed } => {
                        info!("proof {} for evidence {} committed at {}", tx, record.evidence_key, committed);
                        record.transition(ClaimState::Finalized);
                    }
                    TxStatus::Rejected { code, reason } => {
                        if code == TxRejectCode::Mempool {
                            warn!("proof {} dropped by the mempool ({}); resubmitting", tx, reason);
                            record.transition(ClaimState::WaitingForProof);
                        } else {
                            error!("proof {} rejected ({:?}: {}); discarding evidence", tx, code, reason);
                            record.transition(ClaimState::Expired);
                        }
                    }
                    TxStatus::Unknown => {
                        // a consumed claim means the proof landed
                        if registry
                            .get_claim(&identity.address(), &header, kind, registry.latest_height())?
                            .is_none()
                        {
                            record.transition(ClaimState::Finalized);
                        } else {
                            record.transition(ClaimState::WaitingForProof);
                        }
                    }
                }
            }

            ClaimState::Finalized | ClaimState::Expired => {}
        }
        Ok(())
    }

    fn load_evidence(&self, identity: &Identity, key: &Hash) -> Result<Evidence> {
        identity
            .evidence
            .load(key)?
            .ok_or_else(|| Error::MalformedProof(format!("evidence {} disappeared", key)))
    }

    /// Signs and submits, retrying transient mempool failures with
    /// exponential backoff.
    async fn submit(&self, identity: &Identity, msg: TxMsg) -> Result<Hash> {
        let config = self.engine.config();
        let tx = StdTx::new_signed(identity.key(), &config.network_id, msg, config.tx_fee, "")?;
        let mut delay = self.retry_base;
        let mut attempt = 1;
        loop {
            match self.chain.submit_tx(tx.clone()).await {
                Ok(hash) => return Ok(hash),
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    warn!(
                        "submission attempt {}/{} failed, retrying in {:?}: {}",
                        attempt, self.retry_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn adopt_claim(record: &mut ClaimRecord, claim: &Claim) {
    record.root = Some(claim.merkle_root);
    record.total_proofs = claim.total_proofs;
    record.claim_commit_height = Some(claim.commit_height);
    record.expiration_height = Some(claim.expiration_height);
    record.transition(ClaimState::WaitingForProof);
}

/// Transient failures are retried on the next block; a claim the chain
/// already holds is picked up from the registry; anything else loses the
/// evidence.
fn on_submit_error(record: &mut ClaimRecord, what: &str, e: Error) {
    match e {
        e if e.is_transient() => {
            record.attempts += 1;
            warn!(
                "{} for evidence {} not accepted after {} rounds, retrying next block: {}",
                what, record.evidence_key, record.attempts, e
            );
        }
        Error::TxRejected {
            code: TxRejectCode::DuplicateClaim,
            ..
        } => {
            info!("claim for evidence {} already on chain", record.evidence_key);
        }
        e => {
            error!("{} for evidence {} rejected, discarding: {}", what, record.evidence_key, e);
            record.transition(ClaimState::Expired);
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::InvalidProof(format!("tree build aborted: {}", e)))?
}

async fn build_root(evidence: Evidence) -> Result<HashRange> {
    run_blocking(move || Ok(evidence.build_tree()?.root())).await
}

async fn reveal_leaf(evidence: Evidence, index: u64) -> Result<(HashRange, MerkleProof, EvidenceLeaf)> {
    run_blocking(move || {
        let tree = evidence.build_tree()?;
        let proof = tree.proof(index)?;
        let leaf = usize::try_from(index)
            .ok()
            .map(|i| evidence.leaf_at(i))
            .transpose()?
            .flatten()
            .cloned()
            .ok_or_else(|| Error::InvalidProof(format!("no leaf at index {}", index)))?;
        Ok((tree.root(), proof, leaf))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::HostedChains;
    use crate::config::NodeConfig;
    use crate::crypto::{sha3_256, PrivateKey, Signature};
    use crate::registry::{ChainState, MemoryRegistry};
    use crate::storage::MemoryStorage;
    use crate::types::{Aat, RelayProof};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeChain {
        rejections: Mutex<VecDeque<TxRejectCode>>,
        submitted: Mutex<Vec<StdTx>>,
    }

    #[async_trait]
    impl ChainIo for FakeChain {
        async fn submit_tx(&self, tx: StdTx) -> Result<Hash> {
            if let Some(code) = self.rejections.lock().pop_front() {
                return Err(Error::tx_rejected(code, "scripted"));
            }
            let hash = tx.hash()?;
            self.submitted.lock().push(tx);
            Ok(hash)
        }

        async fn tx_status(&self, _hash: &Hash) -> Result<TxStatus> {
            Ok(TxStatus::Pending)
        }
    }

    fn registry(height: i64) -> Arc<MemoryRegistry> {
        let mut state = ChainState::default();
        state.params.supported_blockchains = vec!["0001".into()];
        state.params.supported_geo_zones = vec!["0001".into()];
        let registry = MemoryRegistry::new(state.clone());
        for h in 1..=height {
            state.height = h;
            state.block_hash = sha3_256(&h.to_be_bytes());
            registry.commit(state.clone()).unwrap();
        }
        Arc::new(registry)
    }

    fn setup(height: i64, chain: Arc<FakeChain>) -> (PrivateKey, Arc<Engine>, ProtocolHandler) {
        let key = PrivateKey::from_seed([21u8; 32]);
        let config = NodeConfig {
            claim_retry_base_ms: 1,
            ..NodeConfig::default()
        };
        let engine = Arc::new(
            Engine::new(
                config,
                registry(height),
                Arc::new(HostedChains::new(Vec::new()).unwrap()),
                None,
                vec![key.clone()],
                Arc::new(MemoryStorage::new()),
            )
            .unwrap(),
        );
        let handler = ProtocolHandler::new(engine.clone(), chain).unwrap();
        (key, engine, handler)
    }

    fn record_leaves(engine: &Engine, servicer: &PrivateKey, count: i64) -> Hash {
        let requestor = PrivateKey::from_seed([22u8; 32]);
        let aat = Aat::new_signed(&requestor, requestor.public_key()).unwrap();
        let identity = engine.identity(&servicer.public_key()).unwrap();
        let mut key = Hash::ZERO;
        for entropy in 0..count {
            let proof = RelayProof {
                request_hash: "00".repeat(32),
                entropy: entropy * 7919,
                session_block_height: 1,
                servicer_pub_key: servicer.public_key(),
                blockchain: "0001".into(),
                geo_zone: "0001".into(),
                num_servicers: 1,
                aat: aat.clone(),
                signature: Signature([0u8; 64]),
            };
            key = identity.evidence.add_proof(EvidenceLeaf::Relay(proof)).unwrap().0;
        }
        key
    }

    #[tokio::test]
    async fn test_evidence_below_minimum_is_discarded() {
        let chain = Arc::new(FakeChain::default());
        let (key, engine, handler) = setup(5, chain.clone());
        let evidence = record_leaves(&engine, &key, 4);

        handler.process_block(4).await.unwrap();
        assert_eq!(
            handler.record(&key.public_key(), &evidence).unwrap().unwrap().state,
            ClaimState::Accumulating
        );

        handler.process_block(5).await.unwrap();
        assert!(handler.record(&key.public_key(), &evidence).unwrap().is_none());
        let identity = engine.identity(&key.public_key()).unwrap();
        assert!(identity.evidence.get(&evidence).unwrap().is_none());
        assert!(chain.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_claim_submitted_after_transient_failures() {
        let chain = Arc::new(FakeChain::default());
        chain
            .rejections
            .lock()
            .extend([TxRejectCode::Mempool, TxRejectCode::Mempool]);
        let (key, engine, handler) = setup(5, chain.clone());
        let evidence = record_leaves(&engine, &key, 5);

        handler.process_block(5).await.unwrap();
        let record = handler.record(&key.public_key(), &evidence).unwrap().unwrap();
        assert_eq!(record.state, ClaimState::ClaimPending);
        assert_eq!(record.total_proofs, 5);

        let submitted = chain.submitted.lock();
        assert_eq!(submitted.len(), 1);
        let TxMsg::Claim(claim) = &submitted[0].msg else {
            panic!("expected a claim");
        };
        assert_eq!(claim.total_proofs, 5);
        assert_eq!(Some(claim.merkle_root), record.root);
        assert!(engine
            .identity(&key.public_key())
            .unwrap()
            .evidence
            .is_sealed(&evidence));
    }

    #[tokio::test]
    async fn test_fatal_rejection_discards_evidence() {
        let chain = Arc::new(FakeChain::default());
        chain.rejections.lock().push_back(TxRejectCode::InsufficientFunds);
        let (key, engine, handler) = setup(5, chain);
        let evidence = record_leaves(&engine, &key, 5);

        handler.process_block(5).await.unwrap();
        assert!(handler.record(&key.public_key(), &evidence).unwrap().is_none());
        assert!(engine
            .identity(&key.public_key())
            .unwrap()
            .evidence
            .get(&evidence)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_recover_resumes_sealed_evidence() {
        let chain = Arc::new(FakeChain::default());
        let (key, engine, handler) = setup(5, chain);
        let evidence = record_leaves(&engine, &key, 5);
        let identity = engine.identity(&key.public_key()).unwrap();
        identity.evidence.seal(&evidence).unwrap();

        assert_eq!(handler.recover().unwrap(), 1);
        assert_eq!(
            handler.record(&key.public_key(), &evidence).unwrap().unwrap().state,
            ClaimState::ReadyToClaim
        );
        // second pass finds the record and leaves it alone
        assert_eq!(handler.recover().unwrap(), 0);
    }
}
