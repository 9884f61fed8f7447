use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::crypto::{canonical_hash, sha3_256_concat, verify, Hash, PrivateKey, Signature};
use crate::error::{Error, Result};

use super::proof::RelayProof;

/// HTTP request to pass through to the backing chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub data: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Payload {
    pub fn is_gzipped(&self) -> bool {
        self.headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("content-encoding") && v.trim().eq_ignore_ascii_case("gzip"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMeta {
    pub block_height: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub payload: Payload,
    pub meta: RelayMeta,
    pub proof: RelayProof,
}

impl Relay {
    /// Hash the client commits to in `proof.request_hash`.
    pub fn compute_request_hash(payload: &Payload, meta: &RelayMeta) -> Result<String> {
        Ok(canonical_hash(&json!({ "payload": payload, "meta": meta }))?.to_hex())
    }

    pub fn request_hash(&self) -> Result<String> {
        Self::compute_request_hash(&self.payload, &self.meta)
    }

    /// Shape checks that need no chain state.
    pub fn validate_basic(&self) -> Result<()> {
        if self.payload.data.is_empty() && self.payload.path.is_empty() {
            return Err(Error::MalformedRelay("empty payload".into()));
        }
        if self.proof.blockchain.is_empty() {
            return Err(Error::MalformedRelay("empty blockchain".into()));
        }
        if self.proof.geo_zone.is_empty() {
            return Err(Error::MalformedRelay("empty geo zone".into()));
        }
        if self.proof.num_servicers == 0 {
            return Err(Error::MalformedRelay("num_servicers must be positive".into()));
        }
        if self.proof.session_block_height < 1 {
            return Err(Error::InvalidBlockHeight(format!(
                "session block height {} must be positive",
                self.proof.session_block_height
            )));
        }
        if hex::decode(&self.proof.request_hash).map_or(true, |b| b.len() != Hash::LEN) {
            return Err(Error::MalformedRelay(format!(
                "request hash {:?} is not a hex sha3-256 digest",
                self.proof.request_hash
            )));
        }
        if self.request_hash()? != self.proof.request_hash {
            return Err(Error::MalformedRelay(
                "request hash does not match payload".into(),
            ));
        }
        Ok(())
    }
}

/// Servicer-signed answer to a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub signature: Signature,
    pub response: String,
    pub proof: RelayProof,
}

impl RelayResponse {
    pub fn response_hash(response: &str, proof: &RelayProof) -> Result<Hash> {
        let proof_hash = proof.proof_hash()?;
        Ok(sha3_256_concat(&[response.as_bytes(), proof_hash.as_bytes()]))
    }

    pub fn sign(key: &PrivateKey, response: String, proof: RelayProof) -> Result<Self> {
        let digest = Self::response_hash(&response, &proof)?;
        Ok(Self {
            signature: key.sign(digest.as_bytes()),
            response,
            proof,
        })
    }

    /// Checks the servicer signature against `proof.servicer_pub_key`.
    pub fn verify_signature(&self) -> Result<()> {
        let digest = Self::response_hash(&self.response, &self.proof)?;
        verify(&self.proof.servicer_pub_key, digest.as_bytes(), &self.signature)
            .map_err(|_| Error::BadBackingSignature(self.proof.servicer_pub_key.to_hex()))
    }
}
