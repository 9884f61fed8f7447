//! Node configuration: optional file plus `RELAY_NODE__*` environment
//! overrides, layered with the `config` crate.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::PrivateKey;

pub const MIN_RPC_TIMEOUT_MS: u64 = 1000;
pub const MAX_RPC_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 3000;

const ENV_PREFIX: &str = "RELAY_NODE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevnetConfig {
    pub block_interval_ms: u64,
    pub genesis_path: Option<PathBuf>,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            block_interval_ms: 2000,
            genesis_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub listen_addr: String,
    pub chains_path: Option<PathBuf>,
    pub geozone_path: Option<PathBuf>,
    /// Hex ed25519 seeds; more than one runs several servicers in one process
    pub keys: Vec<String>,
    pub key_file: Option<PathBuf>,
    pub rpc_timeout_ms: u64,
    pub upstream_retries: u32,
    pub session_cache_capacity: usize,
    pub evidence_cache_capacity: usize,
    pub flush_interval_ms: u64,
    pub bloom_expected_proofs: usize,
    pub bloom_false_positive_rate: f64,
    pub claim_retry_attempts: u32,
    pub claim_retry_base_ms: u64,
    pub codec_upgrade_height: i64,
    pub network_id: String,
    pub tx_fee: u64,
    pub persistence: bool,
    pub devnet: DevnetConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            listen_addr: "0.0.0.0:8081".to_string(),
            chains_path: None,
            geozone_path: None,
            keys: Vec::new(),
            key_file: None,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            upstream_retries: 1,
            session_cache_capacity: 500,
            evidence_cache_capacity: 2000,
            flush_interval_ms: 5000,
            bloom_expected_proofs: 10_000,
            bloom_false_positive_rate: 0.01,
            claim_retry_attempts: 5,
            claim_retry_base_ms: 250,
            codec_upgrade_height: 0,
            network_id: "relaynet".to_string(),
            tx_fee: 10_000,
            persistence: false,
            devnet: DevnetConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads `path` (if given and present) then applies environment
    /// overrides such as `RELAY_NODE__RPC_TIMEOUT_MS=5000`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("keys")
                .try_parsing(true),
        );
        let cfg: NodeConfig = builder
            .build()
            .context("building node configuration")?
            .try_deserialize()
            .context("deserializing node configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(anyhow!("listen_addr must be set"));
        }
        if !(0.0..1.0).contains(&self.bloom_false_positive_rate) || self.bloom_false_positive_rate == 0.0 {
            return Err(anyhow!(
                "bloom_false_positive_rate {} must be in (0, 1)",
                self.bloom_false_positive_rate
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(anyhow!("flush_interval_ms must be > 0"));
        }
        if self.network_id.is_empty() {
            return Err(anyhow!("network_id must be set"));
        }
        Ok(())
    }

    /// Outbound RPC timeout, clamped to the supported bounds.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms.clamp(MIN_RPC_TIMEOUT_MS, MAX_RPC_TIMEOUT_MS))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn chains_path(&self) -> PathBuf {
        self.chains_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("config").join("chains.json"))
    }

    pub fn geozone_path(&self) -> PathBuf {
        self.geozone_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("config").join("geozone.json"))
    }

    /// Servicer keys from `keys` and `key_file`, in that order.
    pub fn servicer_keys(&self) -> Result<Vec<PrivateKey>> {
        let mut seeds = self.keys.clone();
        if let Some(path) = &self.key_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading key file {}", path.display()))?;
            let from_file: Vec<String> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing key file {}", path.display()))?;
            seeds.extend(from_file);
        }
        let keys = seeds
            .iter()
            .enumerate()
            .map(|(i, seed)| {
                PrivateKey::from_hex(seed).map_err(|e| anyhow!("servicer key #{}: {}", i, e))
            })
            .collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            return Err(anyhow!("no servicer keys configured"));
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_timeout_clamped() {
        let mut cfg = NodeConfig::default();
        assert_eq!(cfg.rpc_timeout(), Duration::from_millis(3000));
        cfg.rpc_timeout_ms = 5;
        assert_eq!(cfg.rpc_timeout(), Duration::from_millis(MIN_RPC_TIMEOUT_MS));
        cfg.rpc_timeout_ms = 10_000_000;
        assert_eq!(cfg.rpc_timeout(), Duration::from_millis(MAX_RPC_TIMEOUT_MS));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "listen_addr = \"127.0.0.1:9000\"\nrpc_timeout_ms = 4500\n\n[devnet]\nblock_interval_ms = 100\n",
        )
        .unwrap();
        let cfg = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.rpc_timeout_ms, 4500);
        assert_eq!(cfg.devnet.block_interval_ms, 100);
        assert_eq!(cfg.session_cache_capacity, 500);
    }

    #[test]
    fn test_key_file_and_inline_keys() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("keys.json");
        std::fs::write(&key_file, format!("[\"{}\"]", "22".repeat(32))).unwrap();
        let cfg = NodeConfig {
            keys: vec!["11".repeat(32)],
            key_file: Some(key_file),
            ..NodeConfig::default()
        };
        let keys = cfg.servicer_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].public_key(), PrivateKey::from_seed([0x11; 32]).public_key());
    }

    #[test]
    fn test_bad_seed_rejected() {
        let cfg = NodeConfig {
            keys: vec!["zz".into()],
            ..NodeConfig::default()
        };
        assert!(cfg.servicer_keys().is_err());
        assert!(NodeConfig::default().servicer_keys().is_err());
    }
}
