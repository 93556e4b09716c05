//! Websocket transport.
//!
//! Clients speak the RES client protocol over text frames; see
//! [`crate::rpc`] for the request vocabulary.

pub mod handler;

pub use handler::{ws_handler, WebSocketConfig, DEFAULT_MAX_MESSAGE_SIZE};
