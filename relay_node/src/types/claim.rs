use serde::{Deserialize, Serialize};

use crate::crypto::Address;
use crate::merkle::{HashRange, MerkleProof};

use super::proof::{EvidenceKind, EvidenceLeaf};
use super::session::SessionHeader;

/// Commitment to a session's evidence tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgClaim {
    pub session_header: SessionHeader,
    pub merkle_root: HashRange,
    pub total_proofs: u64,
    pub from_address: Address,
    pub evidence_kind: EvidenceKind,
    pub expiration_height: i64,
}

/// Reveal of the pseudorandomly selected leaf of a committed claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgProof {
    pub merkle_proof: MerkleProof,
    pub leaf: EvidenceLeaf,
    pub evidence_kind: EvidenceKind,
}

/// Claim as stored in chain state once its transaction commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub session_header: SessionHeader,
    pub evidence_kind: EvidenceKind,
    pub merkle_root: HashRange,
    pub total_proofs: u64,
    pub from_address: Address,
    pub commit_height: i64,
    pub expiration_height: i64,
}
