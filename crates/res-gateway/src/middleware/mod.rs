//! HTTP middleware and shared instrumentation.
//!
//! Layer order: Request → Trace → CORS → Handler

pub mod cors;
pub mod metrics;

pub use cors::{allowed_methods, create_cors_layer};
pub use metrics::{GatewayMetrics, RequestTimer, WsMethod};
