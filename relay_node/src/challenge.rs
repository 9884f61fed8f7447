//! Challenges: evidence that a servicer answered a request differently
//! from two or more of its session peers.

use log::{debug, info};
use std::collections::HashSet;

use crate::crypto::{Hash, PublicKey};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::merkle::MAX_LEAF_BIN;
use crate::protocol::HandlerMsg;
use crate::session::derive_from_registry;
use crate::types::{ChallengeProofInvalidData, EvidenceLeaf, Session};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeOutcome {
    pub evidence_key: Hash,
    pub accused: PublicKey,
    /// Hosted servicer that recorded the challenge
    pub reporter: PublicKey,
}

/// Stateless checks: shape, shared request and session, signatures, and
/// an actual conflict between majority and minority.
pub fn verify_challenge(challenge: &ChallengeProofInvalidData, minimum_sample_relays: u64) -> Result<()> {
    if challenge.majority_responses.len() < 2 {
        return Err(Error::MalformedProof(format!(
            "challenge needs at least two majority responses, got {}",
            challenge.majority_responses.len()
        )));
    }
    let sample = challenge.majority_responses.len() as u64 + 1;
    if sample < minimum_sample_relays {
        return Err(Error::MalformedProof(format!(
            "challenge sample of {} is below the minimum of {}",
            sample, minimum_sample_relays
        )));
    }

    let minority = &challenge.minority_response.proof;
    // the minority entropy becomes the leaf bin of the challenge evidence
    if minority.bin() > MAX_LEAF_BIN {
        return Err(Error::MalformedProof(format!(
            "minority entropy {} out of range",
            minority.entropy
        )));
    }
    let header = minority.session_header();
    let mut servicers = HashSet::new();
    for response in challenge.all_responses() {
        let proof = &response.proof;
        if proof.request_hash != minority.request_hash {
            return Err(Error::MismatchedRequestHash);
        }
        if proof.session_header() != header {
            return Err(Error::MismatchedSession(format!(
                "servicer {} answered for a different session",
                proof.servicer_pub_key
            )));
        }
        if proof.aat != minority.aat {
            return Err(Error::MismatchedSession("responses carry different tokens".into()));
        }
        if !servicers.insert(proof.servicer_pub_key) {
            return Err(Error::MalformedProof(format!(
                "servicer {} appears twice",
                proof.servicer_pub_key
            )));
        }
        proof.validate_signatures()?;
        response.verify_signature()?;
    }

    let reference = &challenge.majority_responses[0].response;
    if challenge
        .majority_responses
        .iter()
        .any(|r| &r.response != reference)
    {
        return Err(Error::NoConflict);
    }
    if &challenge.minority_response.response == reference {
        return Err(Error::NoConflict);
    }
    Ok(())
}

/// Every responding servicer must belong to `session`.
pub fn verify_membership(challenge: &ChallengeProofInvalidData, session: &Session) -> Result<()> {
    for response in challenge.all_responses() {
        if !session.contains(&response.proof.servicer_pub_key) {
            return Err(Error::MismatchedSession(format!(
                "servicer {} is not in the session",
                response.proof.servicer_pub_key
            )));
        }
    }
    Ok(())
}

/// Validates a reporter-supplied challenge and records it as challenge
/// evidence under a hosted servicer of the session other than the accused.
pub fn handle_challenge(engine: &Engine, challenge: ChallengeProofInvalidData) -> Result<ChallengeOutcome> {
    let registry = engine.registry();
    let current_height = registry.latest_height();
    let params = registry.get_params(current_height)?;
    verify_challenge(&challenge, params.minimum_sample_relays).map_err(|e| {
        debug!("challenge rejected: {}", e);
        e
    })?;

    let header = challenge.session_header();
    if !params.supports_chain(&header.chain) {
        return Err(Error::UnsupportedChain(header.chain));
    }
    if header.num_servicers != params.servicers_per_session {
        return Err(Error::MismatchedSession(format!(
            "sessions hold {} servicers, challenge names {}",
            params.servicers_per_session, header.num_servicers
        )));
    }
    if current_height > params.claim_deadline(header.session_block_height) {
        return Err(Error::WindowExpired(format!(
            "claims for session {} closed before height {}",
            header.session_block_height, current_height
        )));
    }

    let session = derive_from_registry(registry, &header)?;
    verify_membership(&challenge, &session)?;

    let accused = challenge.accused();
    let identity = session
        .servicers
        .iter()
        .filter(|s| s.public_key != accused)
        .find_map(|s| engine.identity(&s.public_key))
        .ok_or_else(|| Error::invalid_session("no servicer hosted here belongs to the challenged session"))?;

    let (evidence_key, meta) = identity
        .evidence
        .add_proof(EvidenceLeaf::Challenge(challenge))?;
    engine.notify(HandlerMsg::RelayAccepted {
        servicer: *identity.public_key(),
        key: evidence_key,
    });
    info!(
        "recorded challenge against {} ({} challenge leaves for session {})",
        accused, meta.leaf_count, header.session_block_height
    );
    Ok(ChallengeOutcome {
        evidence_key,
        accused,
        reporter: *identity.public_key(),
    })
}
