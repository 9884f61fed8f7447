use serde::{Deserialize, Serialize};

/// Protocol parameters, versioned by block height in the registry.
///
/// Windows are expressed in sessions; multiply by
/// `session_block_frequency` to get blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub session_block_frequency: i64,
    pub claim_submission_window: i64,
    pub proof_waiting_period: i64,
    pub claim_expiration: i64,
    pub minimum_number_of_proofs: u64,
    pub replay_attack_burn_multiplier: u64,
    pub minimum_sample_relays: u64,
    pub client_session_sync_allowance: i64,
    /// Session size every relay header must carry
    pub servicers_per_session: u32,
    pub base_relays_per_token: u64,
    pub relays_to_tokens_multiplier: u64,
    pub supported_blockchains: Vec<String>,
    pub supported_geo_zones: Vec<String>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            session_block_frequency: 4,
            claim_submission_window: 3,
            proof_waiting_period: 3,
            claim_expiration: 24,
            minimum_number_of_proofs: 5,
            replay_attack_burn_multiplier: 3,
            minimum_sample_relays: 3,
            client_session_sync_allowance: 1,
            servicers_per_session: 5,
            base_relays_per_token: 100,
            relays_to_tokens_multiplier: 1000,
            supported_blockchains: Vec::new(),
            supported_geo_zones: Vec::new(),
        }
    }
}

impl Params {
    /// Session heights are `1, 1 + sbf, 1 + 2*sbf, ...`.
    pub fn is_session_aligned(&self, height: i64) -> bool {
        height >= 1 && (height - 1) % self.session_block_frequency == 0
    }

    /// Latest session start at or below `height`.
    pub fn session_start(&self, height: i64) -> i64 {
        if height < 1 {
            return 1;
        }
        height - (height - 1) % self.session_block_frequency
    }

    /// First height after the session started at `session_height`.
    pub fn session_end(&self, session_height: i64) -> i64 {
        session_height + self.session_block_frequency
    }

    /// Last height at which a claim for the session is accepted.
    pub fn claim_deadline(&self, session_height: i64) -> i64 {
        self.session_end(session_height) + self.claim_submission_window * self.session_block_frequency
    }

    pub fn claim_expiration_blocks(&self) -> i64 {
        self.claim_expiration * self.session_block_frequency
    }

    pub fn reveal_height(&self, claim_commit_height: i64) -> i64 {
        claim_commit_height + self.proof_waiting_period * self.session_block_frequency
    }

    /// Height past which cached sessions and evidence are dead weight.
    pub fn session_expiry(&self, session_height: i64) -> i64 {
        session_height
            + self.session_block_frequency * (self.claim_expiration + self.claim_submission_window)
    }

    /// Oldest height a late proof can still reference at `height`: a
    /// claim may land up to the claim deadline and live for the claim
    /// expiration after that.
    pub fn history_horizon(&self, height: i64) -> i64 {
        height
            - self.session_block_frequency * (1 + self.claim_submission_window + self.claim_expiration)
    }

    pub fn supports_chain(&self, chain: &str) -> bool {
        self.supported_blockchains.iter().any(|c| c == chain)
    }

    pub fn supports_geo_zone(&self, zone: &str) -> bool {
        self.supported_geo_zones.iter().any(|g| g == zone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_boundaries() {
        let p = Params::default();
        assert!(p.is_session_aligned(1));
        assert!(p.is_session_aligned(5));
        assert!(!p.is_session_aligned(4));
        assert_eq!(p.session_start(4), 1);
        // last block of a session still maps to it; the next one does not
        assert_eq!(p.session_start(1 + p.session_block_frequency - 1), 1);
        assert_eq!(p.session_start(1 + p.session_block_frequency), 5);
        assert_eq!(p.session_start(0), 1);
    }

    #[test]
    fn test_windows() {
        let p = Params::default();
        assert_eq!(p.session_end(1), 5);
        assert_eq!(p.claim_deadline(1), 17);
        assert_eq!(p.reveal_height(10), 22);
        assert_eq!(p.session_expiry(1), 1 + 4 * 27);
        // a claim committed at the deadline of session 1 expires here
        let last_proof = p.claim_deadline(1) + p.claim_expiration_blocks();
        assert_eq!(p.history_horizon(last_proof), 1);
    }
}
