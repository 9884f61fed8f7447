use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use crate::crypto::{canonical_hash, verify, Address, Hash, PrivateKey, PublicKey, Signature};
use crate::error::{Error, Result};

use super::aat::Aat;
use super::relay::RelayResponse;
use super::session::SessionHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Relay,
    Challenge,
}

impl EvidenceKind {
    pub fn as_byte(self) -> u8 {
        match self {
            EvidenceKind::Relay => 0,
            EvidenceKind::Challenge => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceKind::Relay => "relay",
            EvidenceKind::Challenge => "challenge",
        }
    }
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-signed evidence of one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProof {
    pub request_hash: String,
    pub entropy: i64,
    pub session_block_height: i64,
    pub servicer_pub_key: PublicKey,
    pub blockchain: String,
    pub geo_zone: String,
    pub num_servicers: u32,
    pub aat: Aat,
    pub signature: Signature,
}

impl RelayProof {
    /// Merkle sort key: the entropy's bit pattern as an unsigned integer.
    pub fn bin(&self) -> u64 {
        self.entropy as u64
    }

    /// Digest the client signs.
    pub fn proof_hash(&self) -> Result<Hash> {
        Ok(canonical_hash(&json!({
            "aat_hash": self.aat.hash()?.to_hex(),
            "blockchain": self.blockchain,
            "entropy": self.entropy,
            "geo_zone": self.geo_zone,
            "request_hash": self.request_hash,
            "servicer_pub_key": self.servicer_pub_key,
            "session_block_height": self.session_block_height,
        }))?)
    }

    pub fn leaf_hash(&self) -> Result<Hash> {
        Ok(canonical_hash(self)?)
    }

    pub fn session_header(&self) -> SessionHeader {
        SessionHeader {
            requestor_pub_key: self.aat.requestor_pub_key,
            chain: self.blockchain.clone(),
            geo_zone: self.geo_zone.clone(),
            session_block_height: self.session_block_height,
            num_servicers: self.num_servicers,
        }
    }

    /// Signs the proof with the client key named in the AAT.
    pub fn sign(&mut self, client: &PrivateKey) -> Result<()> {
        let digest = self.proof_hash()?;
        self.signature = client.sign(digest.as_bytes());
        Ok(())
    }

    /// Client signature over the proof hash, by the AAT's client key.
    pub fn verify_client_signature(&self) -> Result<()> {
        let digest = self.proof_hash()?;
        verify(&self.aat.client_pub_key, digest.as_bytes(), &self.signature)?;
        Ok(())
    }

    /// AAT validity plus the client signature.
    pub fn validate_signatures(&self) -> Result<()> {
        self.aat.validate()?;
        self.verify_client_signature()
    }
}

/// Two agreeing servicer responses against one disagreeing response to
/// the same request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeProofInvalidData {
    pub majority_responses: Vec<RelayResponse>,
    pub minority_response: RelayResponse,
    pub reporter_address: Address,
}

impl ChallengeProofInvalidData {
    pub fn accused(&self) -> PublicKey {
        self.minority_response.proof.servicer_pub_key
    }

    pub fn session_header(&self) -> SessionHeader {
        self.minority_response.proof.session_header()
    }

    pub fn all_responses(&self) -> impl Iterator<Item = &RelayResponse> {
        self.majority_responses
            .iter()
            .chain(std::iter::once(&self.minority_response))
    }
}

/// A Merkle leaf of either evidence kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceLeaf {
    Relay(RelayProof),
    Challenge(ChallengeProofInvalidData),
}

impl EvidenceLeaf {
    pub fn kind(&self) -> EvidenceKind {
        match self {
            EvidenceLeaf::Relay(_) => EvidenceKind::Relay,
            EvidenceLeaf::Challenge(_) => EvidenceKind::Challenge,
        }
    }

    /// Uniqueness key within an evidence object.
    pub fn entropy(&self) -> i64 {
        match self {
            EvidenceLeaf::Relay(p) => p.entropy,
            EvidenceLeaf::Challenge(c) => c.minority_response.proof.entropy,
        }
    }

    pub fn bin(&self) -> u64 {
        self.entropy() as u64
    }

    /// Tie-break key after `bin`.
    pub fn servicer_pub_key(&self) -> PublicKey {
        match self {
            EvidenceLeaf::Relay(p) => p.servicer_pub_key,
            EvidenceLeaf::Challenge(c) => c.accused(),
        }
    }

    pub fn session_header(&self) -> SessionHeader {
        match self {
            EvidenceLeaf::Relay(p) => p.session_header(),
            EvidenceLeaf::Challenge(c) => c.session_header(),
        }
    }

    pub fn leaf_hash(&self) -> Result<Hash> {
        match self {
            EvidenceLeaf::Relay(p) => p.leaf_hash(),
            EvidenceLeaf::Challenge(c) => Ok(canonical_hash(c)?),
        }
    }

    pub fn as_relay(&self) -> Result<&RelayProof> {
        match self {
            EvidenceLeaf::Relay(p) => Ok(p),
            EvidenceLeaf::Challenge(_) => {
                Err(Error::MalformedProof("expected a relay leaf".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::relay::{Payload, Relay, RelayMeta};
    use std::collections::BTreeMap;

    fn proof(entropy: i64) -> (PrivateKey, RelayProof) {
        let requestor = PrivateKey::from_seed([7u8; 32]);
        let payload = Payload {
            data: r#"{"id":1}"#.into(),
            method: "POST".into(),
            path: String::new(),
            headers: BTreeMap::new(),
        };
        let meta = RelayMeta { block_height: 1 };
        let mut proof = RelayProof {
            request_hash: Relay::compute_request_hash(&payload, &meta).unwrap(),
            entropy,
            session_block_height: 1,
            servicer_pub_key: PrivateKey::from_seed([8u8; 32]).public_key(),
            blockchain: "0001".into(),
            geo_zone: "0001".into(),
            num_servicers: 5,
            aat: Aat::new_signed(&requestor, requestor.public_key()).unwrap(),
            signature: Signature([0u8; 64]),
        };
        proof.sign(&requestor).unwrap();
        (requestor, proof)
    }

    #[test]
    fn test_negative_entropy_bins_above_positive() {
        let (_, neg) = proof(-1);
        let (_, pos) = proof(i64::MAX);
        assert_eq!(neg.bin(), u64::MAX);
        assert!(neg.bin() > pos.bin());
    }

    #[test]
    fn test_signature_covers_entropy() {
        let (_, mut p) = proof(42);
        p.validate_signatures().unwrap();
        p.entropy = 43;
        assert!(p.validate_signatures().is_err());
    }

    #[test]
    fn test_leaf_kind_tagging() {
        let (_, p) = proof(1);
        let leaf = EvidenceLeaf::Relay(p.clone());
        assert_eq!(leaf.kind(), EvidenceKind::Relay);
        assert_eq!(leaf.leaf_hash().unwrap(), p.leaf_hash().unwrap());
        let encoded = serde_json::to_string(&leaf).unwrap();
        assert!(encoded.starts_with(r#"{"relay":"#));
    }
}
