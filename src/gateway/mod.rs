//! Gateway server implementation

mod console;
mod router;
mod server;
mod tokens;

pub use router::{AppState, create_router};
pub use server::Gateway;
pub use tokens::{request_origin, safe_redirect};

/// Prefix of the gateway's own API group
pub const API_PREFIX: &str = "/apis/gateway.tkestack.io/v1";
