//! Hosted backing chains (`chains.json`) and the node's geo zone
//! (`geozone.json`).

use log::{info, warn};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

fn chain_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9a-f]{4,}$").expect("static regex"))
}

pub fn validate_chain_id(id: &str) -> Result<()> {
    if chain_id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "chain id {:?} must be at least four lowercase hex characters",
            id
        )))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedBlockchain {
    pub id: String,
    pub http_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoZone {
    pub id: String,
}

fn index(chains: Vec<HostedBlockchain>) -> Result<HashMap<String, HostedBlockchain>> {
    let mut map = HashMap::with_capacity(chains.len());
    for chain in chains {
        validate_chain_id(&chain.id)?;
        if chain.http_url.is_empty() {
            return Err(Error::Config(format!("chain {} has no http_url", chain.id)));
        }
        if map.insert(chain.id.clone(), chain).is_some() {
            return Err(Error::Config("duplicate chain id in hosted chains".into()));
        }
    }
    Ok(map)
}

fn read_chains(path: &Path) -> Result<Vec<HostedBlockchain>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("parsing {}: {}", path.display(), e)))
}

/// Chain-id → hosted chain map. Readers take a snapshot; reload swaps the
/// whole map under the write lock.
#[derive(Debug, Default)]
pub struct HostedChains {
    inner: RwLock<Arc<HashMap<String, HostedBlockchain>>>,
}

impl HostedChains {
    pub fn new(chains: Vec<HostedBlockchain>) -> Result<Self> {
        Ok(Self {
            inner: RwLock::new(Arc::new(index(chains)?)),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(read_chains(path.as_ref())?)
    }

    /// Re-reads `path`. On any error the current map is kept.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let map = match read_chains(path).and_then(index) {
            Ok(map) => map,
            Err(e) => {
                warn!("keeping hosted chains, reload of {} failed: {}", path.display(), e);
                return Err(e);
            }
        };
        let count = map.len();
        *self.inner.write() = Arc::new(map);
        info!("reloaded {} hosted chains from {}", count, path.display());
        Ok(count)
    }

    pub fn replace(&self, chains: Vec<HostedBlockchain>) -> Result<()> {
        let map = index(chains)?;
        *self.inner.write() = Arc::new(map);
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, HostedBlockchain>> {
        self.inner.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<HostedBlockchain> {
        self.inner.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Parses `geozone.json`. A missing file means no zone restriction; more
/// than one entry is a configuration error.
pub fn load_geo_zone(path: impl AsRef<Path>) -> Result<Option<GeoZone>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
    let mut zones: Vec<GeoZone> = serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("parsing {}: {}", path.display(), e)))?;
    match zones.len() {
        0 => Ok(None),
        1 => {
            let zone = zones.remove(0);
            validate_chain_id(&zone.id)
                .map_err(|_| Error::Config(format!("geo zone id {:?} is not valid hex", zone.id)))?;
            Ok(Some(zone))
        }
        n => Err(Error::Config(format!(
            "{} geo zones configured, at most one is allowed",
            n
        ))),
    }
}
