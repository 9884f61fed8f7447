//! Read-only view of chain state at a height, and the in-memory
//! snapshot store behind it.

pub mod memory;
pub mod view;

pub use memory::{claim_key, ChainState, MemoryRegistry};
pub use view::RegistryView;
