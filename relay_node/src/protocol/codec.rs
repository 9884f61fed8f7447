//! Signed transactions and their two binary framings.
//!
//! Sign bytes are always canonical JSON. The block encoding switches at a
//! configured upgrade height from an amino-style frame to a protobuf-style
//! length-delimited message; both sides of the switch must agree on the
//! height, so it is consensus-critical.

use prost::Message;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{canonical_hash, to_canonical_json, verify, Address, Hash, PrivateKey, PublicKey, Signature};
use crate::error::{Error, Result};
use crate::types::{MsgClaim, MsgProof};

const STD_TX_NAME: &str = "relay/StdTx";
const CLAIM_TYPE_URL: &str = "/relay.MsgClaim";
const PROOF_TYPE_URL: &str = "/relay.MsgProof";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxMsg {
    Claim(MsgClaim),
    Proof(MsgProof),
}

impl TxMsg {
    pub fn type_url(&self) -> &'static str {
        match self {
            TxMsg::Claim(_) => CLAIM_TYPE_URL,
            TxMsg::Proof(_) => PROOF_TYPE_URL,
        }
    }
}

#[derive(Serialize)]
struct SignDoc<'a> {
    chain_id: &'a str,
    entropy: i64,
    fee: u64,
    memo: &'a str,
    msg: &'a TxMsg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdTx {
    pub msg: TxMsg,
    pub fee: u64,
    pub memo: String,
    pub entropy: i64,
    pub signer_pub_key: PublicKey,
    pub signature: Signature,
}

impl StdTx {
    pub fn sign_bytes(chain_id: &str, msg: &TxMsg, fee: u64, memo: &str, entropy: i64) -> Result<Vec<u8>> {
        Ok(to_canonical_json(&SignDoc {
            chain_id,
            entropy,
            fee,
            memo,
            msg,
        })?)
    }

    pub fn new_signed(key: &PrivateKey, chain_id: &str, msg: TxMsg, fee: u64, memo: impl Into<String>) -> Result<Self> {
        let memo = memo.into();
        let entropy: i64 = rand::random();
        let bytes = Self::sign_bytes(chain_id, &msg, fee, &memo, entropy)?;
        Ok(Self {
            signature: key.sign(&bytes),
            signer_pub_key: key.public_key(),
            msg,
            fee,
            memo,
            entropy,
        })
    }

    pub fn verify(&self, chain_id: &str) -> Result<()> {
        let bytes = Self::sign_bytes(chain_id, &self.msg, self.fee, &self.memo, self.entropy)?;
        verify(&self.signer_pub_key, &bytes, &self.signature)?;
        Ok(())
    }

    pub fn signer(&self) -> Address {
        self.signer_pub_key.address()
    }

    /// Independent of the binary framing in use.
    pub fn hash(&self) -> Result<Hash> {
        Ok(canonical_hash(self)?)
    }
}

#[derive(Clone, PartialEq, Message)]
struct ProtoStdTx {
    #[prost(string, tag = "1")]
    type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    msg: Vec<u8>,
    #[prost(uint64, tag = "3")]
    fee: u64,
    #[prost(string, tag = "4")]
    memo: String,
    #[prost(int64, tag = "5")]
    entropy: i64,
    #[prost(bytes = "vec", tag = "6")]
    public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    signature: Vec<u8>,
}

/// Amino registers types under the first 4 bytes of SHA-256(name) that
/// follow the leading zero bytes and a 3-byte disambiguation prefix.
pub fn amino_prefix(name: &str) -> [u8; 4] {
    let digest = Sha256::digest(name.as_bytes());
    let mut rest = digest.iter().skip_while(|b| **b == 0).skip(3);
    let mut prefix = [0u8; 4];
    for byte in prefix.iter_mut() {
        *byte = rest.next().copied().unwrap_or(0);
    }
    prefix
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Amino,
    Proto,
}

#[derive(Debug, Clone, Copy)]
pub struct TxCodec {
    upgrade_height: i64,
}

impl TxCodec {
    /// Heights at or above `upgrade_height` use the protobuf framing.
    pub fn new(upgrade_height: i64) -> Self {
        Self { upgrade_height }
    }

    pub fn encoding_at(&self, height: i64) -> Encoding {
        if height >= self.upgrade_height {
            Encoding::Proto
        } else {
            Encoding::Amino
        }
    }

    pub fn encode(&self, tx: &StdTx, height: i64) -> Result<Vec<u8>> {
        match self.encoding_at(height) {
            Encoding::Amino => encode_amino(tx),
            Encoding::Proto => encode_proto(tx),
        }
    }

    pub fn decode(&self, bytes: &[u8], height: i64) -> Result<StdTx> {
        match self.encoding_at(height) {
            Encoding::Amino => decode_amino(bytes),
            Encoding::Proto => decode_proto(bytes),
        }
    }
}

fn encode_amino(tx: &StdTx) -> Result<Vec<u8>> {
    let body = bincode::serialize(tx)?;
    let prefix = amino_prefix(STD_TX_NAME);
    let mut out = Vec::with_capacity(body.len() + 16);
    prost::encoding::encode_varint((prefix.len() + body.len()) as u64, &mut out);
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_amino(bytes: &[u8]) -> Result<StdTx> {
    let mut buf = bytes;
    let len = prost::encoding::decode_varint(&mut buf)
        .map_err(|e| Error::Codec(format!("amino length: {}", e)))? as usize;
    if buf.len() != len || len < 4 {
        return Err(Error::Codec(format!(
            "amino frame declares {} bytes, {} present",
            len,
            buf.len()
        )));
    }
    let (prefix, body) = buf.split_at(4);
    if prefix != amino_prefix(STD_TX_NAME) {
        return Err(Error::Codec(format!("unknown amino prefix {}", hex::encode(prefix))));
    }
    Ok(bincode::deserialize(body)?)
}

fn encode_proto(tx: &StdTx) -> Result<Vec<u8>> {
    let msg = match &tx.msg {
        TxMsg::Claim(m) => to_canonical_json(m)?,
        TxMsg::Proof(m) => to_canonical_json(m)?,
    };
    let proto = ProtoStdTx {
        type_url: tx.msg.type_url().to_string(),
        msg,
        fee: tx.fee,
        memo: tx.memo.clone(),
        entropy: tx.entropy,
        public_key: tx.signer_pub_key.to_bytes().to_vec(),
        signature: tx.signature.to_bytes().to_vec(),
    };
    Ok(proto.encode_length_delimited_to_vec())
}

fn decode_proto(bytes: &[u8]) -> Result<StdTx> {
    let proto = ProtoStdTx::decode_length_delimited(bytes)
        .map_err(|e| Error::Codec(format!("protobuf: {}", e)))?;
    let msg = match proto.type_url.as_str() {
        CLAIM_TYPE_URL => TxMsg::Claim(serde_json::from_slice(&proto.msg)?),
        PROOF_TYPE_URL => TxMsg::Proof(serde_json::from_slice(&proto.msg)?),
        other => return Err(Error::Codec(format!("unknown message type {}", other))),
    };
    Ok(StdTx {
        msg,
        fee: proto.fee,
        memo: proto.memo,
        entropy: proto.entropy,
        signer_pub_key: PublicKey::from_slice(&proto.public_key)?,
        signature: Signature::from_slice(&proto.signature)?,
    })
}
