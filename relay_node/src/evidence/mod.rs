//! Per-session evidence: the append-only log of proofs a servicer keeps
//! for one `(session header, evidence kind)` pair.

pub mod bloom;
pub mod manager;

pub use bloom::BloomFilter;
pub use manager::{evidence_key, EvidenceManager};

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::error::Result;
use crate::merkle::{sorted_order, SumTree, TreeLeaf};
use crate::types::{EvidenceKind, EvidenceLeaf, SessionHeader};

/// Everything about an evidence object except its leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceMeta {
    pub session_header: SessionHeader,
    pub evidence_kind: EvidenceKind,
    pub servicer: PublicKey,
    pub leaf_count: u64,
    pub total_payable_relays: u64,
    pub bloom: BloomFilter,
    pub sealed: bool,
}

/// An evidence object with its leaves in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    pub meta: EvidenceMeta,
    pub proofs: Vec<EvidenceLeaf>,
}

impl Evidence {
    pub fn tree_leaves(&self) -> Result<Vec<TreeLeaf>> {
        self.proofs
            .iter()
            .map(|leaf| {
                Ok(TreeLeaf {
                    bin: leaf.bin(),
                    servicer: leaf.servicer_pub_key(),
                    hash: leaf.leaf_hash()?,
                })
            })
            .collect()
    }

    pub fn build_tree(&self) -> Result<SumTree> {
        SumTree::build(&self.tree_leaves()?)
    }

    /// Leaf at `index` in tree order.
    pub fn leaf_at(&self, index: usize) -> Result<Option<&EvidenceLeaf>> {
        let order = sorted_order(&self.tree_leaves()?);
        Ok(order.get(index).map(|&i| &self.proofs[i]))
    }
}
