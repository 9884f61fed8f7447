use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::Hash;
use crate::merkle::HashRange;
use crate::types::{EvidenceKind, SessionHeader};

pub const CLAIM_RECORD_PREFIX: &str = "claims/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Accumulating,
    ReadyToClaim,
    ClaimPending,
    WaitingForProof,
    ProofPending,
    Finalized,
    Expired,
}

impl ClaimState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClaimState::Finalized | ClaimState::Expired)
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClaimState::Accumulating => "accumulating",
            ClaimState::ReadyToClaim => "ready_to_claim",
            ClaimState::ClaimPending => "claim_pending",
            ClaimState::WaitingForProof => "waiting_for_proof",
            ClaimState::ProofPending => "proof_pending",
            ClaimState::Finalized => "finalized",
            ClaimState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Last known protocol state of one evidence object, persisted so a
/// restart neither loses nor repeats a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub evidence_key: Hash,
    pub session_header: SessionHeader,
    pub evidence_kind: EvidenceKind,
    pub state: ClaimState,
    pub root: Option<HashRange>,
    pub total_proofs: u64,
    pub claim_tx: Option<Hash>,
    pub claim_commit_height: Option<i64>,
    pub expiration_height: Option<i64>,
    pub proof_tx: Option<Hash>,
    /// Submissions tried in the current state
    pub attempts: u32,
}

impl ClaimRecord {
    pub fn new(evidence_key: Hash, session_header: SessionHeader, evidence_kind: EvidenceKind) -> Self {
        Self {
            evidence_key,
            session_header,
            evidence_kind,
            state: ClaimState::Accumulating,
            root: None,
            total_proofs: 0,
            claim_tx: None,
            claim_commit_height: None,
            expiration_height: None,
            proof_tx: None,
            attempts: 0,
        }
    }

    pub fn transition(&mut self, state: ClaimState) {
        if self.state != state {
            self.state = state;
            self.attempts = 0;
        }
    }
}
