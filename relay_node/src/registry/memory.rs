use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::crypto::{Address, Hash};
use crate::error::{Error, Result};
use crate::types::{Claim, EvidenceKind, Params, RequestorInfo, ServicerInfo, SessionHeader};

use super::view::RegistryView;

/// `claim/<claimant_address>/<session_header_hash>/<evidence_kind>`
pub fn claim_key(address: &Address, header: &SessionHeader, kind: EvidenceKind) -> Result<String> {
    Ok(format!("claim/{}/{}/{}", address, header.hash()?, kind))
}

/// Full chain state as of one committed block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub height: i64,
    pub block_hash: Hash,
    pub params: Params,
    pub servicers: BTreeMap<Address, ServicerInfo>,
    pub requestors: BTreeMap<Address, RequestorInfo>,
    pub claims: BTreeMap<String, Claim>,
    pub balances: BTreeMap<Address, u64>,
}

impl ChainState {
    pub fn add_servicer(&mut self, servicer: ServicerInfo) {
        self.servicers.insert(servicer.address, servicer);
    }

    /// Stakes a requestor, fixing its relay budget from current params.
    pub fn add_requestor(&mut self, mut requestor: RequestorInfo) {
        requestor.max_relays =
            RequestorInfo::max_relays_for(requestor.staked_tokens, self.params.base_relays_per_token);
        self.requestors.insert(requestor.address, requestor);
    }

    pub fn claim(&self, address: &Address, header: &SessionHeader, kind: EvidenceKind) -> Result<Option<&Claim>> {
        Ok(self.claims.get(&claim_key(address, header, kind)?))
    }

    pub fn insert_claim(&mut self, claim: Claim) -> Result<()> {
        let key = claim_key(&claim.from_address, &claim.session_header, claim.evidence_kind)?;
        self.claims.insert(key, claim);
        Ok(())
    }

    pub fn remove_claim(&mut self, address: &Address, header: &SessionHeader, kind: EvidenceKind) -> Result<Option<Claim>> {
        Ok(self.claims.remove(&claim_key(address, header, kind)?))
    }

    pub fn claims_of(&self, address: &Address) -> Vec<Claim> {
        let prefix = format!("claim/{}/", address);
        self.claims
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn mint(&mut self, address: &Address, amount: u64) {
        let balance = self.balances.entry(*address).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    /// Fails without change when the balance is short.
    pub fn debit(&mut self, address: &Address, amount: u64) -> bool {
        if amount == 0 {
            return true;
        }
        match self.balances.get_mut(address) {
            Some(balance) if *balance >= amount => {
                *balance -= amount;
                true
            }
            _ => false,
        }
    }

    /// Slashes a servicer's stake. A servicer slashed to zero is jailed.
    /// Returns the amount actually burned.
    pub fn burn_stake(&mut self, address: &Address, amount: u64) -> u64 {
        let Some(servicer) = self.servicers.get_mut(address) else {
            return 0;
        };
        let burned = amount.min(servicer.staked_tokens);
        servicer.staked_tokens -= burned;
        if servicer.staked_tokens == 0 {
            servicer.jailed = true;
        }
        burned
    }
}

/// Copy-on-commit snapshots, one per height.
#[derive(Debug)]
pub struct MemoryRegistry {
    snapshots: RwLock<BTreeMap<i64, Arc<ChainState>>>,
}

impl MemoryRegistry {
    pub fn new(genesis: ChainState) -> Self {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(genesis.height, Arc::new(genesis));
        Self {
            snapshots: RwLock::new(snapshots),
        }
    }

    /// Appends the state of the next block.
    pub fn commit(&self, state: ChainState) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        let latest = snapshots.keys().next_back().copied().unwrap_or(0);
        if state.height != latest + 1 {
            return Err(Error::InvalidBlockHeight(format!(
                "commit of height {} on top of {}",
                state.height, latest
            )));
        }
        debug!("registry committed height {}", state.height);
        snapshots.insert(state.height, Arc::new(state));
        Ok(())
    }

    pub fn snapshot(&self, height: i64) -> Result<Arc<ChainState>> {
        self.snapshots
            .read()
            .get(&height)
            .cloned()
            .ok_or(Error::BlockNotFound(height))
    }

    pub fn latest(&self) -> Arc<ChainState> {
        let snapshots = self.snapshots.read();
        match snapshots.values().next_back() {
            Some(state) => state.clone(),
            None => Arc::new(ChainState::default()),
        }
    }

    /// Drops snapshots below `height`, always keeping the latest.
    pub fn prune_below(&self, height: i64) -> usize {
        let mut snapshots = self.snapshots.write();
        let latest = snapshots.keys().next_back().copied().unwrap_or(0);
        let keep_from = height.min(latest);
        let kept = snapshots.split_off(&keep_from);
        let pruned = snapshots.len();
        *snapshots = kept;
        pruned
    }
}

impl RegistryView for MemoryRegistry {
    fn latest_height(&self) -> i64 {
        self.snapshots.read().keys().next_back().copied().unwrap_or(0)
    }

    fn block_hash(&self, height: i64) -> Result<Hash> {
        Ok(self.snapshot(height)?.block_hash)
    }

    fn get_params(&self, height: i64) -> Result<Params> {
        Ok(self.snapshot(height)?.params.clone())
    }

    fn validators_for(&self, chain: &str, geo_zone: &str, height: i64) -> Result<Vec<ServicerInfo>> {
        Ok(self
            .snapshot(height)?
            .servicers
            .values()
            .filter(|s| s.staked_tokens > 0 && s.serves(chain, geo_zone))
            .cloned()
            .collect())
    }

    fn servicer(&self, address: &Address, height: i64) -> Result<Option<ServicerInfo>> {
        Ok(self.snapshot(height)?.servicers.get(address).cloned())
    }

    fn requestor(&self, address: &Address, height: i64) -> Result<Option<RequestorInfo>> {
        Ok(self
            .snapshot(height)?
            .requestors
            .get(address)
            .filter(|r| !r.jailed)
            .cloned())
    }

    fn get_claim(
        &self,
        address: &Address,
        header: &SessionHeader,
        kind: EvidenceKind,
        height: i64,
    ) -> Result<Option<Claim>> {
        Ok(self.snapshot(height)?.claim(address, header, kind)?.cloned())
    }

    fn get_all_claims(&self, address: &Address, height: i64) -> Result<Vec<Claim>> {
        Ok(self.snapshot(height)?.claims_of(address))
    }
}
