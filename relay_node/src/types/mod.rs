//! Wire and state types shared by every component.

pub mod aat;
pub mod claim;
pub mod params;
pub mod proof;
pub mod relay;
pub mod session;

pub use aat::{Aat, AAT_VERSION};
pub use claim::{Claim, MsgClaim, MsgProof};
pub use params::Params;
pub use proof::{ChallengeProofInvalidData, EvidenceKind, EvidenceLeaf, RelayProof};
pub use relay::{Payload, Relay, RelayMeta, RelayResponse};
pub use session::{DispatchResponse, Session, SessionHeader, SessionServicer};

use serde::{Deserialize, Serialize};

use crate::crypto::{Address, PublicKey};

/// Staked servicer as seen by session selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicerInfo {
    pub address: Address,
    pub public_key: PublicKey,
    pub service_url: String,
    pub chains: Vec<String>,
    pub geo_zones: Vec<String>,
    pub staked_tokens: u64,
    #[serde(default)]
    pub jailed: bool,
}

impl ServicerInfo {
    pub fn serves(&self, chain: &str, geo_zone: &str) -> bool {
        !self.jailed
            && self.chains.iter().any(|c| c == chain)
            && self.geo_zones.iter().any(|g| g == geo_zone)
    }
}

/// Staked requestor. `max_relays` is fixed at stake time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestorInfo {
    pub address: Address,
    pub public_key: PublicKey,
    pub chains: Vec<String>,
    pub staked_tokens: u64,
    pub max_relays: u64,
    #[serde(default)]
    pub jailed: bool,
}

impl RequestorInfo {
    pub fn max_relays_for(staked_tokens: u64, base_relays_per_token: u64) -> u64 {
        ((staked_tokens as u128 * base_relays_per_token as u128) / 100).min(u64::MAX as u128) as u64
    }
}
