//! # res-bus - Message Bus Client for RES Traffic
//!
//! The gateway talks to services exclusively through a subject-based message
//! bus. This crate defines the client contract the gateway depends on and
//! ships two implementations of it.
//!
//! ## Contract
//!
//! ```text
//! ┌──────────────┐  subscribe("event.foo")  ┌──────────────┐
//! │   Gateway    │ ───────────────────────▶ │     Bus      │
//! │              │  send_request("get.foo") │              │
//! │              │ ───────────────────────▶ │              │
//! │              │ ◀─────────────────────── │              │
//! └──────────────┘   handler / callback     └──────────────┘
//! ```
//!
//! - Subscriptions receive every message on `<namespace>.*`.
//! - Request callbacks are invoked exactly once, with the response payload or
//!   a [`BusError`] (timeout, no responders, ...).
//! - Inbound messages and responses are delivered through a single listener,
//!   in the order they were received.
//!
//! ## Implementations
//!
//! - [`NatsBus`]: production client on top of `async-nats`.
//! - [`MemoryBus`]: in-process bus used by unit and integration tests.

#![warn(clippy::all)]
#![deny(unsafe_code)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod client;
pub mod error;
pub mod memory;
pub mod nats;
pub mod pending;
pub mod subject;

// Re-export main types
pub use client::{
    BusClient, BusMessage, ClosedHandler, MessageHandler, ResponseCallback, Unsubscriber,
};
pub use error::BusError;
pub use memory::{MemoryBus, MemoryRequest};
pub use nats::NatsBus;
pub use pending::{PendingRequestStore, PendingStats};

/// Maximum length of a subject plus reply inbox accepted by the server.
pub const MAX_CONTROL_LINE_SIZE: usize = 4096;

/// Default timeout for requests sent on the bus.
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
