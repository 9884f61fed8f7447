//! Chain-side half of the claim/proof protocol and a local chain to run
//! it on.

pub mod keeper;
pub mod local;

pub use keeper::{apply_claim, apply_proof, prune_expired_claims, ProofOutcome};
pub use local::{GenesisDoc, LocalChain};
