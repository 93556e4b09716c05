//! # res-gateway - Realtime Resource Gateway
//!
//! Gives websocket and HTTP clients access to resources served by services
//! on a message bus. Resources are fetched once, cached, kept up to date by
//! bus events and fanned out to every subscribed client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            res-gateway                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   ┌─────────────┐        ┌─────────────┐        ┌─────────────┐     │
//! │   │  WebSocket  │        │  HTTP API   │        │  /metrics   │     │
//! │   │   <wsPath>  │        │  <apiPath>  │        │             │     │
//! │   └──────┬──────┘        └──────┬──────┘        └─────────────┘     │
//! │          │                      │ temporary conn                    │
//! │   ┌──────┴──────────────────────┴──────┐                            │
//! │   │   Connections (conn)               │  client subscriptions,     │
//! │   │   one worker task per client       │  reference graph, GC       │
//! │   └──────────────────┬─────────────────┘                            │
//! │                      │                                              │
//! │   ┌──────────────────┴─────────────────┐                            │
//! │   │   Resource cache (rescache)        │  hubs per resource name,   │
//! │   │   worker pool                      │  one snapshot per query    │
//! │   └──────────────────┬─────────────────┘                            │
//! └──────────────────────┼──────────────────────────────────────────────┘
//!                        │ get / access / call / auth, event.*, system.*
//!                   Message bus (res-bus)
//!                        │
//!         ┌──────────────┼──────────────┐
//!         ▼              ▼              ▼
//!      service A      service B      service C
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use res_gateway::{GatewayConfig, GatewayService};
//!
//! let bus = Arc::new(NatsBus::new("nats://127.0.0.1:4222"));
//! let mut service = GatewayService::new(GatewayConfig::default(), bus)?;
//! service.start().await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod api;
pub mod codec;
pub mod conn;
pub mod domain;
pub mod middleware;
pub mod rescache;
pub mod router;
pub mod rpc;
pub mod service;
pub mod telemetry;
pub mod ws;

// Re-exports for public API
pub use conn::{Conn, ConnContext, ConnHandle, OutFrame};
pub use domain::config::GatewayConfig;
pub use domain::error::{codes, GatewayError, ResError, ResResult};
pub use middleware::GatewayMetrics;
pub use rescache::{CacheOptions, ResourceCache};
pub use router::{build_router, AppState};
pub use service::GatewayService;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
