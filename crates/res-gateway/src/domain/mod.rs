//! Domain types for the gateway.
//!
//! Configuration, the RES error envelope and resource identifier helpers.

pub mod config;
pub mod error;
pub mod rid;

// Re-exports for convenience
pub use config::{ConfigError, GatewayConfig};
pub use error::{codes, GatewayError, ResError, ResResult};
pub use rid::{expand_cid, is_valid_rid, is_valid_rid_part, join_rid, split_method, split_rid};
