//! JSON-over-HTTP surface of the node.

pub mod errors;
pub mod server;

pub use errors::{ApiError, ApiResult, ErrorResponse};
pub use server::{create_router, serve, AppState};
