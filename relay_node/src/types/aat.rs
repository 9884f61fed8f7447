use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crypto::{canonical_hash, verify, Hash, PrivateKey, PublicKey, Signature};
use crate::error::{Error, Result};

pub const AAT_VERSION: &str = "0.0.1";

/// Application authentication token: the requestor delegates relay signing
/// to `client_pub_key`, which may be the requestor key itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aat {
    pub version: String,
    pub requestor_pub_key: PublicKey,
    pub client_pub_key: PublicKey,
    pub requestor_signature: Signature,
}

impl Aat {
    /// Builds and signs a token with the requestor's key.
    pub fn new_signed(requestor: &PrivateKey, client_pub_key: PublicKey) -> Result<Self> {
        let requestor_pub_key = requestor.public_key();
        let digest = Self::sign_digest(AAT_VERSION, &requestor_pub_key, &client_pub_key)?;
        Ok(Self {
            version: AAT_VERSION.to_string(),
            requestor_pub_key,
            client_pub_key,
            requestor_signature: requestor.sign(digest.as_bytes()),
        })
    }

    fn sign_digest(version: &str, requestor: &PublicKey, client: &PublicKey) -> Result<Hash> {
        Ok(canonical_hash(&json!({
            "version": version,
            "requestor_pub_key": requestor,
            "client_pub_key": client,
        }))?)
    }

    /// Digest the requestor signs: the token without its signature.
    pub fn signing_hash(&self) -> Result<Hash> {
        Self::sign_digest(&self.version, &self.requestor_pub_key, &self.client_pub_key)
    }

    /// Hash of the complete token, signature included.
    pub fn hash(&self) -> Result<Hash> {
        Ok(canonical_hash(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != AAT_VERSION {
            return Err(Error::MalformedAat(format!(
                "unsupported version {:?}",
                self.version
            )));
        }
        let digest = self.signing_hash()?;
        verify(
            &self.requestor_pub_key,
            digest.as_bytes(),
            &self.requestor_signature,
        )?;
        Ok(())
    }
}
