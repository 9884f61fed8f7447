//! Root assembly: everything a servicer process shares, built once at
//! startup and passed by reference.

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chains::{GeoZone, HostedChains};
use crate::challenge::{self, ChallengeOutcome};
use crate::config::NodeConfig;
use crate::crypto::{Address, PrivateKey, PublicKey};
use crate::error::{Error, Result};
use crate::evidence::EvidenceManager;
use crate::protocol::HandlerMsg;
use crate::registry::RegistryView;
use crate::relay::{self, Forwarder, RelayBudget};
use crate::session::{self, SessionCache};
use crate::storage::{Flushable, Storage};
use crate::types::{ChallengeProofInvalidData, DispatchResponse, Relay, RelayResponse, SessionHeader};

/// One servicer key and the state kept on its behalf. Nothing here is
/// shared with other identities in the same process.
pub struct Identity {
    key: PrivateKey,
    public_key: PublicKey,
    address: Address,
    pub evidence: EvidenceManager,
    pub sessions: SessionCache,
    pub budget: RelayBudget,
}

impl Identity {
    fn open(key: PrivateKey, config: &NodeConfig, store: Arc<dyn Storage>) -> Result<Self> {
        let public_key = key.public_key();
        let address = public_key.address();
        Ok(Self {
            evidence: EvidenceManager::open(
                store.clone(),
                public_key,
                config.evidence_cache_capacity,
                config.bloom_expected_proofs,
                config.bloom_false_positive_rate,
            )?,
            sessions: SessionCache::open(store, &address.to_hex(), config.session_cache_capacity)?,
            budget: RelayBudget::new(),
            key,
            public_key,
            address,
        })
    }

    pub fn key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

pub struct Engine {
    config: NodeConfig,
    registry: Arc<dyn RegistryView>,
    chains: Arc<HostedChains>,
    geo_zone: Option<GeoZone>,
    identities: BTreeMap<PublicKey, Identity>,
    forwarder: Forwarder,
    store: Arc<dyn Storage>,
    events: OnceLock<mpsc::UnboundedSender<HandlerMsg>>,
}

impl Engine {
    pub fn new(
        config: NodeConfig,
        registry: Arc<dyn RegistryView>,
        chains: Arc<HostedChains>,
        geo_zone: Option<GeoZone>,
        keys: Vec<PrivateKey>,
        store: Arc<dyn Storage>,
    ) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::Config("at least one servicer key is required".into()));
        }
        let mut identities = BTreeMap::new();
        for key in keys {
            let identity = Identity::open(key, &config, store.clone())?;
            info!("hosting servicer {}", identity.address());
            if identities.insert(identity.public_key, identity).is_some() {
                return Err(Error::Config("duplicate servicer key".into()));
            }
        }
        let forwarder = Forwarder::new(config.rpc_timeout(), config.upstream_retries)?;
        Ok(Self {
            config,
            registry,
            chains,
            geo_zone,
            identities,
            forwarder,
            store,
            events: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &dyn RegistryView {
        self.registry.as_ref()
    }

    pub fn chains(&self) -> &HostedChains {
        &self.chains
    }

    pub fn geo_zone(&self) -> Option<&GeoZone> {
        self.geo_zone.as_ref()
    }

    pub fn identity(&self, public_key: &PublicKey) -> Option<&Identity> {
        self.identities.get(public_key)
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub async fn handle_relay(&self, relay: Relay) -> Result<(RelayResponse, Option<DispatchResponse>)> {
        relay::handle_relay(self, relay).await
    }

    pub fn handle_challenge(&self, challenge: ChallengeProofInvalidData) -> Result<ChallengeOutcome> {
        challenge::handle_challenge(self, challenge)
    }

    pub fn dispatch(&self, header: &SessionHeader) -> Result<DispatchResponse> {
        session::dispatch(self.registry(), header, self.registry.latest_height())
    }

    /// Routes engine events to the protocol handler. Only one handler may
    /// be attached.
    pub fn attach_handler(&self, sender: mpsc::UnboundedSender<HandlerMsg>) -> Result<()> {
        self.events
            .set(sender)
            .map_err(|_| Error::Config("a protocol handler is already attached".into()))
    }

    pub fn notify(&self, msg: HandlerMsg) {
        let Some(sender) = self.events.get() else {
            return;
        };
        if sender.send(msg).is_err() {
            debug!("protocol handler stopped; event dropped");
        }
    }

    pub fn flushables(&self) -> Vec<&dyn Flushable> {
        self.identities
            .values()
            .flat_map(|identity| {
                let [meta, leaves] = identity.evidence.flushables();
                [meta, leaves, identity.sessions.cache() as &dyn Flushable]
            })
            .collect()
    }

    /// Writes every dirty cache entry, then flushes the store.
    pub fn flush_all(&self) -> Result<usize> {
        let mut written = 0;
        for cache in self.flushables() {
            written += cache.flush_all()?;
        }
        self.store.flush()?;
        if written > 0 {
            debug!("flushed {} cache entries", written);
        }
        Ok(written)
    }

    /// Drops sessions and budget counters that can no longer be used.
    pub fn evict_expired(&self, height: i64) -> Result<usize> {
        let params = self.registry.get_params(height)?;
        let oldest_live = params.session_start(height)
            - params.client_session_sync_allowance * params.session_block_frequency;
        let mut evicted = 0;
        for identity in self.identities.values() {
            evicted += identity.sessions.evict_expired(height, &params)?;
            identity.budget.prune_before(oldest_live);
        }
        Ok(evicted)
    }

    /// Periodic `flush_all` until `shutdown` flips to true.
    pub fn spawn_flush_task(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.flush_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.flush_all() {
                            warn!("periodic flush failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("flush task stopped");
        })
    }
}
