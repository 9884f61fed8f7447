//! Sum-Merkle tree over evidence leaves.
//!
//! Every node carries a half-open `[lower, upper)` range next to its hash.
//! Leaves are sorted by `bin`, padded with zero-hash sentinels to a power
//! of two, and given contiguous ranges, so an inclusion proof also
//! authenticates where the leaf sits in the bin order.

use serde::{Deserialize, Serialize};

use crate::crypto::{sha3_256_concat, Hash, PublicKey};
use crate::error::{Error, Result};

/// Bins above this value are refused at admission so padding can never
/// overflow `u64`.
pub const MAX_LEAF_BIN: u64 = u64::MAX - (1 << 32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Range {
    pub lower: u64,
    pub upper: u64,
}

impl Range {
    pub fn is_empty(&self) -> bool {
        self.upper <= self.lower
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HashRange {
    pub hash: Hash,
    pub range: Range,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub target_index: u64,
    /// Siblings from the leaf level up to just below the root
    pub hash_ranges: Vec<HashRange>,
    pub target_range: Range,
}

/// Input to [`SumTree::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLeaf {
    pub bin: u64,
    pub servicer: PublicKey,
    pub hash: Hash,
}

/// Indices of `leaves` in tree order: by bin, then servicer key, then hash.
pub fn sorted_order(leaves: &[TreeLeaf]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..leaves.len()).collect();
    order.sort_by(|&a, &b| {
        let (la, lb) = (&leaves[a], &leaves[b]);
        (la.bin, la.servicer, la.hash).cmp(&(lb.bin, lb.servicer, lb.hash))
    });
    order
}

fn parent(left: &HashRange, right: &HashRange) -> HashRange {
    let hash = sha3_256_concat(&[
        left.hash.as_bytes(),
        &left.range.lower.to_be_bytes(),
        &left.range.upper.to_be_bytes(),
        right.hash.as_bytes(),
        &right.range.lower.to_be_bytes(),
        &right.range.upper.to_be_bytes(),
    ]);
    HashRange {
        hash,
        range: Range {
            lower: left.range.lower,
            upper: right.range.upper,
        },
    }
}

#[derive(Debug, Clone)]
pub struct SumTree {
    /// `levels[0]` are the padded leaves, the last level holds the root
    levels: Vec<Vec<HashRange>>,
    num_leaves: usize,
    order: Vec<usize>,
}

impl SumTree {
    pub fn build(leaves: &[TreeLeaf]) -> Result<Self> {
        if leaves.is_empty() {
            return Err(Error::InvalidProof("cannot build a tree with no leaves".into()));
        }
        let order = sorted_order(leaves);
        let padded_len = leaves.len().next_power_of_two().max(2);

        let mut bins: Vec<u64> = order.iter().map(|&i| leaves[i].bin).collect();
        let mut hashes: Vec<Hash> = order.iter().map(|&i| leaves[i].hash).collect();
        let mut next = bins[bins.len() - 1];
        while bins.len() < padded_len {
            next = next
                .checked_add(1)
                .ok_or_else(|| Error::InvalidProof("leaf bin overflows padding".into()))?;
            bins.push(next);
            hashes.push(Hash::ZERO);
        }
        let last_upper = next
            .checked_add(1)
            .ok_or_else(|| Error::InvalidProof("leaf bin overflows padding".into()))?;

        let mut level: Vec<HashRange> = (0..padded_len)
            .map(|i| HashRange {
                hash: hashes[i],
                range: Range {
                    lower: bins[i],
                    upper: bins.get(i + 1).copied().unwrap_or(last_upper),
                },
            })
            .collect();

        let mut levels = Vec::new();
        while level.len() > 1 {
            let up = level.chunks(2).map(|pair| parent(&pair[0], &pair[1])).collect();
            levels.push(level);
            level = up;
        }
        levels.push(level);

        Ok(Self {
            levels,
            num_leaves: leaves.len(),
            order,
        })
    }

    pub fn root(&self) -> HashRange {
        self.levels[self.levels.len() - 1][0]
    }

    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    pub fn padded_len(&self) -> usize {
        self.levels[0].len()
    }

    /// Position in the input slice of the leaf at sorted `index`.
    pub fn input_index(&self, index: usize) -> Option<usize> {
        self.order.get(index).copied()
    }

    pub fn proof(&self, target_index: u64) -> Result<MerkleProof> {
        let index = usize::try_from(target_index)
            .ok()
            .filter(|&i| i < self.num_leaves)
            .ok_or_else(|| {
                Error::InvalidProof(format!(
                    "index {} out of range for {} leaves",
                    target_index, self.num_leaves
                ))
            })?;

        let mut hash_ranges = Vec::with_capacity(self.levels.len() - 1);
        let mut i = index;
        for level in &self.levels[..self.levels.len() - 1] {
            hash_ranges.push(level[i ^ 1]);
            i >>= 1;
        }
        Ok(MerkleProof {
            target_index,
            hash_ranges,
            target_range: self.levels[0][index].range,
        })
    }
}

/// Recomputes the root from `leaf_hash` and the proof path, enforcing range
/// contiguity at every level.
pub fn verify(root: &HashRange, proof: &MerkleProof, leaf_hash: &Hash, leaf_bin: u64) -> Result<()> {
    let depth = proof.hash_ranges.len();
    if depth == 0 || depth > 63 {
        return Err(Error::InvalidProof(format!("bad proof depth {}", depth)));
    }
    if proof.target_index >= 1u64 << depth {
        return Err(Error::InvalidProof(format!(
            "target index {} exceeds tree of depth {}",
            proof.target_index, depth
        )));
    }
    if leaf_hash.is_zero() {
        return Err(Error::InvalidProof("sentinel leaf cannot be proven".into()));
    }
    if proof.target_range.lower != leaf_bin || proof.target_range.is_empty() {
        return Err(Error::InvalidProof(format!(
            "target range {:?} does not start at bin {}",
            proof.target_range, leaf_bin
        )));
    }

    let mut current = HashRange {
        hash: *leaf_hash,
        range: proof.target_range,
    };
    let mut index = proof.target_index;
    for sibling in &proof.hash_ranges {
        current = if index & 1 == 0 {
            if current.range.upper != sibling.range.lower || sibling.range.is_empty() {
                return Err(Error::InvalidProof("non-contiguous right sibling".into()));
            }
            parent(&current, sibling)
        } else {
            if sibling.range.upper != current.range.lower || sibling.range.is_empty() {
                return Err(Error::InvalidProof("non-contiguous left sibling".into()));
            }
            parent(sibling, &current)
        };
        index >>= 1;
    }

    if current != *root {
        return Err(Error::InvalidProof("root mismatch".into()));
    }
    Ok(())
}

/// Pseudorandom leaf to reveal:
/// `be_u64(SHA3-256(reveal_block_hash || session_key)[0..8]) mod total_proofs`.
pub fn target_index(reveal_block_hash: &Hash, session_key: &Hash, total_proofs: u64) -> Result<u64> {
    if total_proofs == 0 {
        return Err(Error::InvalidProof("claim has no proofs".into()));
    }
    let digest = sha3_256_concat(&[reveal_block_hash.as_bytes(), session_key.as_bytes()]);
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.0[..8]);
    Ok(u64::from_be_bytes(word) % total_proofs)
}
