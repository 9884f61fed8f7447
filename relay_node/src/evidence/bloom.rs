//! Bloom filter over relay entropies.

use serde::{Deserialize, Serialize};

use crate::crypto::sha3_256;

const MIN_BITS: u64 = 64;
const MAX_HASHES: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sized for `expected_items` at `false_positive_rate`.
    pub fn with_rate(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil() as u64;
        let num_bits = m.max(MIN_BITS).next_multiple_of(64);
        let k = ((num_bits as f64 / n) * ln2).round() as u32;
        Self {
            bits: vec![0u64; (num_bits / 64) as usize],
            num_bits,
            num_hashes: k.clamp(1, MAX_HASHES),
        }
    }

    // double hashing: h1 + i*h2
    fn positions(&self, entropy: i64) -> impl Iterator<Item = u64> + '_ {
        let digest = sha3_256(&entropy.to_be_bytes());
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&digest.0[..8]);
        b.copy_from_slice(&digest.0[8..16]);
        let h1 = u64::from_be_bytes(a);
        let h2 = u64::from_be_bytes(b) | 1;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    pub fn insert(&mut self, entropy: i64) {
        let positions: Vec<u64> = self.positions(entropy).collect();
        for pos in positions {
            self.bits[(pos / 64) as usize] |= 1 << (pos % 64);
        }
    }

    /// `false` means definitely absent.
    pub fn may_contain(&self, entropy: i64) -> bool {
        self.positions(entropy)
            .all(|pos| self.bits[(pos / 64) as usize] & (1 << (pos % 64)) != 0)
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_always_found() {
        let mut bloom = BloomFilter::with_rate(1000, 0.01);
        for e in -500..500i64 {
            bloom.insert(e * 7919);
        }
        for e in -500..500i64 {
            assert!(bloom.may_contain(e * 7919));
        }
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let mut bloom = BloomFilter::with_rate(1000, 0.01);
        for e in 0..1000i64 {
            bloom.insert(e);
        }
        let false_positives = (1_000_000..1_010_000i64).filter(|&e| bloom.may_contain(e)).count();
        // 1% target, generous bound
        assert!(false_positives < 300, "{} false positives", false_positives);
    }

    #[test]
    fn test_sizing() {
        let bloom = BloomFilter::with_rate(10_000, 0.01);
        assert!(bloom.num_bits() >= 95_000);
        assert_eq!(bloom.num_hashes(), 7);
        assert_eq!(BloomFilter::with_rate(0, 0.01).num_bits() % 64, 0);
    }
}
