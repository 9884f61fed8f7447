//! Deterministic state transitions for claims and proofs, applied while a
//! block is being built.
//!
//! `state` is the block under construction (`state.height == height`),
//! `history` serves committed heights below it. Checks run before any
//! mutation, except that once a proof has been evaluated against a claim
//! the claim is consumed whatever the verdict.

use log::{debug, info};

use crate::challenge::{verify_challenge, verify_membership};
use crate::crypto::{Address, Hash};
use crate::error::{Error, Result, TxRejectCode};
use crate::merkle::{target_index, verify};
use crate::registry::{ChainState, RegistryView};
use crate::session::{derive_session, session_key};
use crate::types::{Claim, EvidenceKind, EvidenceLeaf, MsgClaim, MsgProof, Session, SessionHeader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofOutcome {
    /// Valid relay evidence; tokens minted to the claimant
    Rewarded { claimant: Address, amount: u64 },
    /// Valid challenge; the accused servicer's stake was burned
    ChallengeUpheld { accused: Address, burned: u64 },
    /// Forged or replayed leaf; the claimant's stake was burned
    Slashed { claimant: Address, burned: u64 },
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::tx_rejected(TxRejectCode::Invalid, reason)
}

fn block_hash_at(state: &ChainState, history: &dyn RegistryView, height: i64) -> Result<Hash> {
    if height == state.height {
        Ok(state.block_hash)
    } else {
        history.block_hash(height)
    }
}

fn session_at(state: &ChainState, history: &dyn RegistryView, header: &SessionHeader) -> Result<Session> {
    let height = header.session_block_height;
    let block_hash = block_hash_at(state, history, height)?;
    let candidates = history.validators_for(&header.chain, &header.geo_zone, height)?;
    derive_session(header, block_hash, &candidates)
}

pub fn apply_claim(
    state: &mut ChainState,
    history: &dyn RegistryView,
    signer: &Address,
    msg: &MsgClaim,
    height: i64,
) -> Result<()> {
    if msg.from_address != *signer {
        return Err(invalid("claim is not signed by its from_address"));
    }
    let header = &msg.session_header;
    header.validate_basic()?;
    let params = &state.params;
    let session_height = header.session_block_height;
    if !params.is_session_aligned(session_height) {
        return Err(invalid(format!("session height {} is not a session start", session_height)));
    }
    if height < params.session_end(session_height) {
        return Err(invalid(format!("session {} has not ended at {}", session_height, height)));
    }
    if height > params.claim_deadline(session_height) {
        return Err(Error::WindowExpired(format!(
            "claims for session {} closed at {}",
            session_height,
            params.claim_deadline(session_height)
        )));
    }
    let minimum = match msg.evidence_kind {
        EvidenceKind::Relay => params.minimum_number_of_proofs,
        EvidenceKind::Challenge => 1,
    };
    if msg.total_proofs < minimum {
        return Err(invalid(format!(
            "{} proofs claimed, at least {} required",
            msg.total_proofs, minimum
        )));
    }
    if msg.merkle_root.range.is_empty() {
        return Err(invalid("claim root covers an empty range"));
    }
    let session = session_at(state, history, header)?;
    if !session.contains_address(signer) {
        return Err(invalid(format!("{} is not a servicer of the session", signer)));
    }
    if state.claim(signer, header, msg.evidence_kind)?.is_some() {
        return Err(Error::tx_rejected(
            TxRejectCode::DuplicateClaim,
            format!("{} already claimed session {}", signer, session_height),
        ));
    }

    let claim = Claim {
        session_header: header.clone(),
        evidence_kind: msg.evidence_kind,
        merkle_root: msg.merkle_root,
        total_proofs: msg.total_proofs,
        from_address: *signer,
        commit_height: height,
        expiration_height: height + state.params.claim_expiration_blocks(),
    };
    state.insert_claim(claim)?;
    debug!("claim by {} for session {} stored at {}", signer, session_height, height);
    Ok(())
}

pub fn apply_proof(
    state: &mut ChainState,
    history: &dyn RegistryView,
    signer: &Address,
    msg: &MsgProof,
    height: i64,
) -> Result<ProofOutcome> {
    let leaf = &msg.leaf;
    if leaf.kind() != msg.evidence_kind {
        return Err(invalid("leaf kind does not match the declared evidence kind"));
    }
    let header = leaf.session_header();
    let claim = state
        .claim(signer, &header, msg.evidence_kind)?
        .cloned()
        .ok_or_else(|| {
            Error::tx_rejected(
                TxRejectCode::ClaimNotFound,
                format!("no claim by {} for session {}", signer, header.session_block_height),
            )
        })?;
    if height > claim.expiration_height {
        return Err(Error::WindowExpired(format!(
            "claim expired at {}",
            claim.expiration_height
        )));
    }
    let reveal = state.params.reveal_height(claim.commit_height);
    if height < reveal {
        return Err(invalid(format!("proof at {} precedes reveal height {}", height, reveal)));
    }

    let reveal_hash = block_hash_at(state, history, reveal)?;
    let key = session_key(&header, &block_hash_at(state, history, header.session_block_height)?);
    let expected = target_index(&reveal_hash, &key, claim.total_proofs)?;
    let inclusion = if msg.merkle_proof.target_index != expected {
        Err(Error::InvalidProof(format!(
            "proof reveals leaf {}, expected {}",
            msg.merkle_proof.target_index, expected
        )))
    } else {
        verify(&claim.merkle_root, &msg.merkle_proof, &leaf.leaf_hash()?, leaf.bin())
    };
    if let Err(e) = inclusion {
        state.remove_claim(signer, &header, msg.evidence_kind)?;
        return Err(e);
    }

    let verdict = check_leaf(state, history, signer, leaf);
    state.remove_claim(signer, &header, msg.evidence_kind)?;
    let multiplier = state.params.relays_to_tokens_multiplier;
    let value = claim.total_proofs.saturating_mul(multiplier);
    let outcome = match (verdict, leaf) {
        (Ok(()), EvidenceLeaf::Relay(_)) => {
            state.mint(signer, value);
            ProofOutcome::Rewarded {
                claimant: *signer,
                amount: value,
            }
        }
        (Ok(()), EvidenceLeaf::Challenge(challenge)) => {
            let accused = challenge.accused().address();
            let burned = state.burn_stake(&accused, value);
            ProofOutcome::ChallengeUpheld { accused, burned }
        }
        (Err(e), _) => {
            info!("proof by {} carries an invalid leaf: {}", signer, e);
            let penalty = value.saturating_mul(state.params.replay_attack_burn_multiplier);
            let burned = state.burn_stake(signer, penalty);
            ProofOutcome::Slashed {
                claimant: *signer,
                burned,
            }
        }
    };
    Ok(outcome)
}

fn check_leaf(state: &ChainState, history: &dyn RegistryView, signer: &Address, leaf: &EvidenceLeaf) -> Result<()> {
    match leaf {
        EvidenceLeaf::Relay(proof) => {
            if proof.servicer_pub_key.address() != *signer {
                return Err(Error::UnknownServicer(proof.servicer_pub_key.to_hex()));
            }
            proof.validate_signatures()
        }
        EvidenceLeaf::Challenge(challenge) => {
            verify_challenge(challenge, state.params.minimum_sample_relays)?;
            let session = session_at(state, history, &challenge.session_header())?;
            verify_membership(challenge, &session)?;
            if challenge.accused().address() == *signer {
                return Err(Error::MalformedProof("a servicer cannot claim a challenge against itself".into()));
            }
            if !session.contains_address(signer) {
                return Err(Error::MismatchedSession(format!("{} is not in the challenged session", signer)));
            }
            Ok(())
        }
    }
}

/// Removes claims past their expiration height. Returns how many.
pub fn prune_expired_claims(state: &mut ChainState, height: i64) -> usize {
    let before = state.claims.len();
    state.claims.retain(|_, claim| claim.expiration_height >= height);
    let pruned = before - state.claims.len();
    if pruned > 0 {
        debug!("pruned {} expired claims at {}", pruned, height);
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha3_256, PrivateKey};
    use crate::merkle::{SumTree, TreeLeaf};
    use crate::registry::MemoryRegistry;
    use crate::crypto::Signature;
    use crate::types::{Aat, RelayProof, ServicerInfo};

    struct Fixture {
        servicer: PrivateKey,
        history: MemoryRegistry,
        leaves: Vec<EvidenceLeaf>,
        tree: SumTree,
    }

    fn header(requestor: &PrivateKey) -> SessionHeader {
        SessionHeader {
            requestor_pub_key: requestor.public_key(),
            chain: "0001".into(),
            geo_zone: "0001".into(),
            session_block_height: 1,
            num_servicers: 1,
        }
    }

    /// Chain with one servicer, committed up to `height - 1`, and six relay
    /// leaves for session 1, client-signed unless `forged`.
    fn build_fixture(height: i64, forged: bool) -> Fixture {
        let servicer = PrivateKey::from_seed([31u8; 32]);
        let requestor = PrivateKey::from_seed([32u8; 32]);
        let mut state = ChainState::default();
        state.params.supported_blockchains = vec!["0001".into()];
        state.params.supported_geo_zones = vec!["0001".into()];
        state.params.proof_waiting_period = 1;
        state.add_servicer(ServicerInfo {
            address: servicer.address(),
            public_key: servicer.public_key(),
            service_url: "http://s1".into(),
            chains: vec!["0001".into()],
            geo_zones: vec!["0001".into()],
            staked_tokens: 1_000_000_000,
            jailed: false,
        });
        let history = MemoryRegistry::new(state.clone());
        for h in 1..height {
            state.height = h;
            state.block_hash = sha3_256(&h.to_be_bytes());
            history.commit(state.clone()).unwrap();
        }

        let aat = Aat::new_signed(&requestor, requestor.public_key()).unwrap();
        let leaves: Vec<EvidenceLeaf> = (0..6)
            .map(|i| {
                let mut proof = RelayProof {
                    request_hash: "ab".repeat(32),
                    entropy: 1_000 * (i + 1),
                    session_block_height: 1,
                    servicer_pub_key: servicer.public_key(),
                    blockchain: "0001".into(),
                    geo_zone: "0001".into(),
                    num_servicers: 1,
                    aat: aat.clone(),
                    signature: Signature([0u8; 64]),
                };
                if !forged {
                    proof.sign(&requestor).unwrap();
                }
                EvidenceLeaf::Relay(proof)
            })
            .collect();
        let tree_leaves: Vec<TreeLeaf> = leaves
            .iter()
            .map(|l| TreeLeaf {
                bin: l.bin(),
                servicer: l.servicer_pub_key(),
                hash: l.leaf_hash().unwrap(),
            })
            .collect();
        let tree = SumTree::build(&tree_leaves).unwrap();
        Fixture {
            servicer,
            history,
            leaves,
            tree,
        }
    }

    fn fixture(height: i64) -> Fixture {
        build_fixture(height, false)
    }

    fn building(history: &MemoryRegistry, height: i64) -> ChainState {
        let mut state = (*history.latest()).clone();
        state.height = height;
        state.block_hash = sha3_256(&height.to_be_bytes());
        state
    }

    fn claim_msg(f: &Fixture) -> MsgClaim {
        MsgClaim {
            session_header: header(&PrivateKey::from_seed([32u8; 32])),
            merkle_root: f.tree.root(),
            total_proofs: 6,
            from_address: f.servicer.address(),
            evidence_kind: EvidenceKind::Relay,
            expiration_height: 0,
        }
    }

    #[test]
    fn test_claim_window() {
        let f = fixture(8);
        let signer = f.servicer.address();
        let msg = claim_msg(&f);

        let mut early = building(&f.history, 4);
        assert!(matches!(
            apply_claim(&mut early, &f.history, &signer, &msg, 4),
            Err(Error::TxRejected { code: TxRejectCode::Invalid, .. })
        ));

        let mut state = building(&f.history, 8);
        apply_claim(&mut state, &f.history, &signer, &msg, 8).unwrap();
        let claim = state.claim(&signer, &msg.session_header, EvidenceKind::Relay).unwrap().unwrap();
        assert_eq!(claim.commit_height, 8);
        assert_eq!(claim.expiration_height, 8 + state.params.claim_expiration_blocks());
        assert!(matches!(
            apply_claim(&mut state, &f.history, &signer, &msg, 8),
            Err(Error::TxRejected { code: TxRejectCode::DuplicateClaim, .. })
        ));
    }

    #[test]
    fn test_claim_rejections() {
        let f = fixture(8);
        let signer = f.servicer.address();
        let mut state = building(&f.history, 8);

        let mut few = claim_msg(&f);
        few.total_proofs = 4;
        assert!(apply_claim(&mut state, &f.history, &signer, &few, 8).is_err());

        let stranger = PrivateKey::from_seed([99u8; 32]).address();
        let mut foreign = claim_msg(&f);
        foreign.from_address = stranger;
        assert!(apply_claim(&mut state, &f.history, &stranger, &foreign, 8).is_err());
        assert!(apply_claim(&mut state, &f.history, &stranger, &claim_msg(&f), 8).is_err());
        assert!(state.claims.is_empty());
    }

    #[test]
    fn test_late_claim_expired() {
        let f = fixture(20);
        let mut state = building(&f.history, 20);
        assert!(matches!(
            apply_claim(&mut state, &f.history, &f.servicer.address(), &claim_msg(&f), 20),
            Err(Error::WindowExpired(_))
        ));
    }

    fn claimed(f: &Fixture, at: i64) -> MemoryRegistry {
        let mut state = building(&f.history, at);
        apply_claim(&mut state, &f.history, &f.servicer.address(), &claim_msg(f), at).unwrap();
        let history = MemoryRegistry::new(ChainState::default());
        for h in 1..at {
            history.commit((*f.history.snapshot(h).unwrap()).clone()).unwrap();
        }
        history.commit(state).unwrap();
        history
    }

    fn proof_for(f: &Fixture, history: &MemoryRegistry, state: &ChainState, commit: i64) -> MsgProof {
        let reveal = state.params.reveal_height(commit);
        let reveal_hash = block_hash_at(state, history, reveal).unwrap();
        let key = session_key(
            &header(&PrivateKey::from_seed([32u8; 32])),
            &history.block_hash(1).unwrap(),
        );
        let index = target_index(&reveal_hash, &key, 6).unwrap();
        let order = crate::merkle::sorted_order(
            &f.leaves
                .iter()
                .map(|l| TreeLeaf {
                    bin: l.bin(),
                    servicer: l.servicer_pub_key(),
                    hash: l.leaf_hash().unwrap(),
                })
                .collect::<Vec<_>>(),
        );
        MsgProof {
            merkle_proof: f.tree.proof(index).unwrap(),
            leaf: f.leaves[order[index as usize]].clone(),
            evidence_kind: EvidenceKind::Relay,
        }
    }

    #[test]
    fn test_valid_proof_rewards_and_consumes_claim() {
        let f = fixture(8);
        let history = claimed(&f, 8);
        let signer = f.servicer.address();
        // proof_waiting_period 1 with frequency 4: reveal at 12
        let mut early = building(&history, 11);
        for h in 9..11 {
            history.commit(building(&history, h)).unwrap();
        }
        let msg = proof_for(&f, &history, &building(&history, 12), 8);
        assert!(apply_proof(&mut early, &history, &signer, &msg, 11).is_err());

        let mut state = building(&history, 11);
        history.commit(state.clone()).unwrap();
        state = building(&history, 12);
        let outcome = apply_proof(&mut state, &history, &signer, &msg, 12).unwrap();
        assert_eq!(
            outcome,
            ProofOutcome::Rewarded {
                claimant: signer,
                amount: 6 * state.params.relays_to_tokens_multiplier
            }
        );
        assert_eq!(state.balance(&signer), 6 * state.params.relays_to_tokens_multiplier);
        assert!(matches!(
            apply_proof(&mut state, &history, &signer, &msg, 12),
            Err(Error::TxRejected { code: TxRejectCode::ClaimNotFound, .. })
        ));
    }

    #[test]
    fn test_wrong_index_consumes_claim() {
        let f = fixture(8);
        let history = claimed(&f, 8);
        for h in 9..12 {
            history.commit(building(&history, h)).unwrap();
        }
        let signer = f.servicer.address();
        let mut state = building(&history, 12);
        let mut msg = proof_for(&f, &history, &state, 8);
        // wrong index: claim consumed without reward
        msg.merkle_proof.target_index = (msg.merkle_proof.target_index + 1) % 6;
        assert!(matches!(
            apply_proof(&mut state, &history, &signer, &msg, 12),
            Err(Error::InvalidProof(_))
        ));
        assert!(state.claims.is_empty());
        assert_eq!(state.balance(&signer), 0);
    }

    #[test]
    fn test_forged_leaf_is_slashed() {
        let f = build_fixture(8, true);
        let history = claimed(&f, 8);
        for h in 9..12 {
            history.commit(building(&history, h)).unwrap();
        }
        let signer = f.servicer.address();
        let mut state = building(&history, 12);
        let msg = proof_for(&f, &history, &state, 8);
        let outcome = apply_proof(&mut state, &history, &signer, &msg, 12).unwrap();
        let penalty = 6 * state.params.relays_to_tokens_multiplier * state.params.replay_attack_burn_multiplier;
        assert_eq!(
            outcome,
            ProofOutcome::Slashed {
                claimant: signer,
                burned: penalty
            }
        );
        assert_eq!(state.servicers[&signer].staked_tokens, 1_000_000_000 - penalty);
        assert!(state.claims.is_empty());
    }

    #[test]
    fn test_prune_expired() {
        let f = fixture(8);
        let history = claimed(&f, 8);
        let mut state = building(&history, 9);
        let expiration = 8 + state.params.claim_expiration_blocks();
        assert_eq!(prune_expired_claims(&mut state, expiration), 0);
        assert_eq!(prune_expired_claims(&mut state, expiration + 1), 1);
    }
}
