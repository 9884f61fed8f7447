use ed25519_dalek::{Signer, SigningKey, VerifyingKey};

use super::hash::{sha3_256, sha3_256_concat};
use super::CryptoError;

/// Raw ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PublicKey(pub [u8; 32]);

hex_newtype!(PublicKey, 32, CryptoError::MalformedKey);

/// First 20 bytes of SHA3-256(public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

hex_newtype!(Address, 20, CryptoError::MalformedKey);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

hex_newtype!(Signature, 64, CryptoError::MalformedSignature);

impl PublicKey {
    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }

    /// Fails with `MalformedKey` when the bytes are not a valid curve point.
    pub fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| CryptoError::MalformedKey(e.to_string()))
    }
}

impl Address {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = sha3_256(key.as_bytes());
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.0[..20]);
        Self(out)
    }

    /// Address of a multi-signature account: the constituent keys are
    /// hashed in the order given.
    pub fn from_multisig(keys: &[PublicKey]) -> Self {
        let parts: Vec<&[u8]> = keys.iter().map(|k| k.as_bytes()).collect();
        let digest = sha3_256_concat(&parts);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.0[..20]);
        Self(out)
    }
}

/// Ed25519 signing key. `Debug` never prints the secret.
#[derive(Clone)]
pub struct PrivateKey {
    signing_key: SigningKey,
}

impl PrivateKey {
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::MalformedKey(format!("expected 32-byte seed, got {} bytes", bytes.len()))
        })?;
        Ok(Self::from_seed(seed))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.signing_key.sign(msg).to_bytes())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey(pub={})", self.public_key())
    }
}

pub fn verify(public_key: &PublicKey, msg: &[u8], signature: &Signature) -> Result<(), CryptoError> {
    let verifying_key = public_key.verifying_key()?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    verifying_key
        .verify_strict(msg, &sig)
        .map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = PrivateKey::generate();
        let sig = key.sign(b"hello relay");
        assert!(verify(&key.public_key(), b"hello relay", &sig).is_ok());
        assert_eq!(
            verify(&key.public_key(), b"other", &sig),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn test_address_is_hash_prefix() {
        let key = PrivateKey::from_seed([7u8; 32]);
        let pk = key.public_key();
        let digest = sha3_256(pk.as_bytes());
        assert_eq!(&pk.address().0[..], &digest.0[..20]);
        assert_eq!(pk.address().to_hex().len(), 40);
    }

    #[test]
    fn test_multisig_address_depends_on_order() {
        let a = PrivateKey::from_seed([1u8; 32]).public_key();
        let b = PrivateKey::from_seed([2u8; 32]).public_key();
        assert_ne!(Address::from_multisig(&[a, b]), Address::from_multisig(&[b, a]));
        assert_eq!(Address::from_multisig(&[a]), a.address());
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(
            PublicKey::from_hex("00"),
            Err(CryptoError::MalformedKey(_))
        ));
        assert!(matches!(
            Signature::from_hex(&"11".repeat(63)),
            Err(CryptoError::MalformedSignature(_))
        ));
        assert!(PrivateKey::from_hex("not-hex").is_err());
    }

    #[test]
    fn test_serde_uses_hex_strings() {
        let pk = PrivateKey::from_seed([3u8; 32]).public_key();
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", pk.to_hex()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
    }
}
