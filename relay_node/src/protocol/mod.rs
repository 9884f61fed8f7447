//! Claim-then-proof protocol: the per-evidence state machine that turns
//! recorded relays into on-chain rewards.

pub mod chain_io;
pub mod codec;
pub mod handler;
pub mod record;

pub use chain_io::{ChainIo, TxStatus};
pub use codec::{StdTx, TxCodec, TxMsg};
pub use handler::{HandlerHandle, HandlerMsg, ProtocolHandler};
pub use record::{ClaimRecord, ClaimState, CLAIM_RECORD_PREFIX};
