use sha3::{Digest, Sha3_256};

use super::CryptoError;

/// SHA3-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; 32]);

hex_newtype!(Hash, 32, CryptoError::MalformedDigest);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

pub fn sha3_256(data: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// SHA3-256 over the concatenation of `parts`, without copying them.
pub fn sha3_256_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha3_known_vector() {
        // SHA3-256("")
        assert_eq!(
            sha3_256(b"").to_hex(),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn test_concat_matches_single_buffer() {
        assert_eq!(sha3_256_concat(&[b"ab", b"cd"]), sha3_256(b"abcd"));
    }

    #[test]
    fn test_hash_hex_roundtrip_and_errors() {
        let h = sha3_256(b"relay");
        assert_eq!(Hash::from_hex(&h.to_hex()).unwrap(), h);
        assert!(matches!(
            Hash::from_hex("abcd"),
            Err(CryptoError::MalformedDigest(_))
        ));
        assert!(Hash::from_hex("zz").is_err());
    }
}
