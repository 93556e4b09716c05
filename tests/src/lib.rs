//! # res-gateway Test Suite
//!
//! Integration scenarios driving the gateway crates together over the
//! in-memory bus.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── mod.rs              # Shared fixtures (gateway, websocket client)
//!     ├── resource_flows.rs   # Load, events, query sharing, reset
//!     ├── lifecycle_flows.rs  # Idle tear-down, reaccess, reference GC
//!     └── http_flows.rs       # HTTP API sharing the cache with websocket clients
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p res-tests
//!
//! # By flow
//! cargo test -p res-tests integration::resource_flows::
//! cargo test -p res-tests integration::lifecycle_flows::
//! cargo test -p res-tests integration::http_flows::
//! ```

#![allow(unused_variables)]
#![allow(unused_imports)]
#![allow(dead_code)]

pub mod integration;
