use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::Hash;
use crate::error::{Result, TxRejectCode};

use super::codec::StdTx;

/// Where a submitted transaction stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TxStatus {
    /// Accepted into the mempool, not yet in a block
    Pending,
    Committed { height: i64 },
    Rejected { code: TxRejectCode, reason: String },
    /// Never seen, or forgotten by the chain
    Unknown,
}

/// Write side of the chain, as used by the protocol handler. Reads go
/// through `RegistryView`; commits arrive as `BlockCommitted` messages.
#[async_trait]
pub trait ChainIo: Send + Sync {
    /// Queues `tx` for inclusion. A mempool-level check failure is
    /// returned as `Error::TxRejected`.
    async fn submit_tx(&self, tx: StdTx) -> Result<Hash>;

    async fn tx_status(&self, hash: &Hash) -> Result<TxStatus>;
}
