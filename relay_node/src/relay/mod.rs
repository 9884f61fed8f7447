//! Relay servicing: validation, admission, forwarding and evidence.

pub mod budget;
pub mod forward;
pub mod pipeline;

pub use budget::{servicer_limit, RelayBudget, Reservation};
pub use forward::Forwarder;
pub use pipeline::handle_relay;
