use serde::{Deserialize, Serialize};

use crate::crypto::{canonical_hash, Address, Hash, PublicKey};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHeader {
    pub requestor_pub_key: PublicKey,
    pub chain: String,
    pub geo_zone: String,
    pub session_block_height: i64,
    pub num_servicers: u32,
}

impl SessionHeader {
    pub fn validate_basic(&self) -> Result<()> {
        if self.chain.is_empty() {
            return Err(Error::MalformedRelay("empty chain in session header".into()));
        }
        if self.geo_zone.is_empty() {
            return Err(Error::MalformedRelay("empty geo zone in session header".into()));
        }
        if self.session_block_height < 1 {
            return Err(Error::InvalidBlockHeight(format!(
                "session block height {} must be positive",
                self.session_block_height
            )));
        }
        if self.num_servicers == 0 {
            return Err(Error::MalformedRelay("num_servicers must be positive".into()));
        }
        Ok(())
    }

    /// Content hash of the header's canonical encoding.
    pub fn hash(&self) -> Result<Hash> {
        Ok(canonical_hash(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionServicer {
    pub address: Address,
    pub public_key: PublicKey,
    pub service_url: String,
}

/// Servicers selected for a header at a given block hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_key: Hash,
    pub header: SessionHeader,
    pub block_hash: Hash,
    pub servicers: Vec<SessionServicer>,
}

impl Session {
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.servicers.iter().any(|s| &s.public_key == key)
    }

    pub fn contains_address(&self, address: &Address) -> bool {
        self.servicers.iter().any(|s| &s.address == address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub session: Session,
    /// Height at which the dispatch was computed
    pub block_height: i64,
}
