//! HTTP integration: client key extraction, middleware and server.

mod client_key;
mod layer;
mod server;

pub use client_key::{client_key, X_FORWARDED_FOR, X_REAL_IP};
pub use layer::{RateLimitLayer, RateLimitService, UNKNOWN_CLIENT};
pub use server::HttpServer;
