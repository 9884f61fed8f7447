use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::storage::StorageError;
use crate::types::DispatchResponse;

/// Error category, used for HTTP mapping and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    Crypto,
    Policy,
    Upstream,
    Storage,
    Protocol,
}

/// Reason a transaction was refused by the mempool or by block execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxRejectCode {
    /// Mempool full or temporarily unavailable
    Mempool,
    InvalidSignature,
    InsufficientFunds,
    DuplicateClaim,
    ClaimNotFound,
    /// Failed on-chain validation
    Invalid,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed relay: {0}")]
    MalformedRelay(String),

    #[error("malformed proof: {0}")]
    MalformedProof(String),

    #[error("malformed application authentication token: {0}")]
    MalformedAat(String),

    #[error("invalid block height: {0}")]
    InvalidBlockHeight(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("invalid merkle proof: {0}")]
    InvalidProof(String),

    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("unsupported geo zone: {0}")]
    UnsupportedGeoZone(String),

    #[error("requestor {0} is not staked")]
    NotStakedRequestor(String),

    #[error("requestor {requestor} exceeded its budget of {limit} relays for this session")]
    OverService { requestor: String, limit: u64 },

    #[error("invalid session: {reason}")]
    InvalidSession {
        reason: String,
        dispatch: Option<Box<DispatchResponse>>,
    },

    #[error("duplicate proof: entropy {0} already recorded for this session")]
    DuplicateProof(i64),

    #[error("not enough staked servicers: {required} required, {available} available")]
    InsufficientServicers { required: u32, available: usize },

    #[error("servicer {0} is not hosted by this node")]
    UnknownServicer(String),

    #[error("challenge responses do not share a request hash")]
    MismatchedRequestHash,

    #[error("challenge responses do not share a session: {0}")]
    MismatchedSession(String),

    #[error("challenge responses do not conflict")]
    NoConflict,

    #[error("bad backing-node signature from servicer {0}")]
    BadBackingSignature(String),

    #[error("upstream timed out after {0} ms")]
    UpstreamTimeout(u64),

    #[error("upstream returned HTTP {status}")]
    UpstreamHttp { status: u16, body: String },

    #[error("upstream network error: {0}")]
    UpstreamNetwork(#[source] reqwest::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transaction rejected ({code:?}): {reason}")]
    TxRejected { code: TxRejectCode, reason: String },

    #[error("window expired: {0}")]
    WindowExpired(String),

    #[error("block {0} not found")]
    BlockNotFound(i64),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedRelay(_)
            | Error::MalformedProof(_)
            | Error::MalformedAat(_)
            | Error::InvalidBlockHeight(_)
            | Error::Codec(_)
            | Error::Config(_) => ErrorKind::Input,
            Error::Crypto(_) | Error::InvalidProof(_) | Error::BadBackingSignature(_) => {
                ErrorKind::Crypto
            }
            Error::UnsupportedChain(_)
            | Error::UnsupportedGeoZone(_)
            | Error::NotStakedRequestor(_)
            | Error::OverService { .. }
            | Error::InvalidSession { .. }
            | Error::DuplicateProof(_)
            | Error::InsufficientServicers { .. }
            | Error::UnknownServicer(_)
            | Error::MismatchedRequestHash
            | Error::MismatchedSession(_)
            | Error::NoConflict => ErrorKind::Policy,
            Error::UpstreamTimeout(_) | Error::UpstreamHttp { .. } | Error::UpstreamNetwork(_) => {
                ErrorKind::Upstream
            }
            Error::Storage(_) => ErrorKind::Storage,
            Error::TxRejected { .. } | Error::WindowExpired(_) | Error::BlockNotFound(_) => {
                ErrorKind::Protocol
            }
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::UpstreamNetwork(_) => true,
            Error::Storage(e) => e.is_transient(),
            Error::TxRejected { code, .. } => *code == TxRejectCode::Mempool,
            _ => false,
        }
    }

    pub fn dispatch(&self) -> Option<&DispatchResponse> {
        match self {
            Error::InvalidSession { dispatch, .. } => dispatch.as_deref(),
            _ => None,
        }
    }

    pub fn invalid_session(reason: impl Into<String>) -> Self {
        Error::InvalidSession {
            reason: reason.into(),
            dispatch: None,
        }
    }

    pub fn tx_rejected(code: TxRejectCode, reason: impl Into<String>) -> Self {
        Error::TxRejected {
            code,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(format!("json: {}", err))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Codec(format!("bincode: {}", err))
    }
}
