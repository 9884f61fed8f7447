//! Signing, hashing and canonical encoding primitives.
//!
//! Everything hashed on this network goes through SHA3-256, and every
//! structure is hashed over its canonical JSON encoding.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("malformed public key: {0}")]
    MalformedKey(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("malformed digest: {0}")]
    MalformedDigest(String),
}

/// Implements hex (de)serialization and the usual accessors for a
/// fixed-size byte newtype.
macro_rules! hex_newtype {
    ($name:ident, $len:expr, $err:path) => {
        impl $name {
            pub const LEN: usize = $len;

            pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, $crate::crypto::CryptoError> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| {
                    $err(format!("expected {} bytes, got {}", $len, bytes.len()))
                })?;
                Ok(Self(arr))
            }

            pub fn from_hex(s: &str) -> std::result::Result<Self, $crate::crypto::CryptoError> {
                let bytes = hex::decode(s).map_err(|e| $err(format!("{}: {}", e, s)))?;
                Self::from_slice(&bytes)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_bytes(&self) -> [u8; $len] {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::crypto::CryptoError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

pub mod canonical;
pub mod hash;
pub mod keys;

pub use canonical::{canonical_hash, to_canonical_json};
pub use hash::{sha3_256, sha3_256_concat, Hash};
pub use keys::{verify, Address, PrivateKey, PublicKey, Signature};
