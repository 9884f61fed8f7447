//! Servicer node for a decentralized RPC relay network.
//!
//! A servicer answers relays for the sessions it is selected into, keeps
//! the signed relay proofs as evidence, and later earns rewards through a
//! two-phase claim-then-proof protocol against the chain.

pub mod api;
pub mod chains;
pub mod challenge;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod merkle;
pub mod onchain;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod storage;
pub mod types;

pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
