//! RES error envelope and gateway-level errors.
//!
//! Every response on the bus and to clients carries either a result or an
//! error object `{code, message, data?}` with a `system.*` code.

use res_bus::BusError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Standard RES error codes
pub mod codes {
    pub const ACCESS_DENIED: &str = "system.accessDenied";
    pub const INTERNAL_ERROR: &str = "system.internalError";
    pub const INVALID_PARAMS: &str = "system.invalidParams";
    pub const INVALID_QUERY: &str = "system.invalidQuery";
    pub const METHOD_NOT_FOUND: &str = "system.methodNotFound";
    pub const NO_SUBSCRIPTION: &str = "system.noSubscription";
    pub const NOT_FOUND: &str = "system.notFound";
    pub const TIMEOUT: &str = "system.timeout";
    pub const INVALID_REQUEST: &str = "system.invalidRequest";
    pub const UNSUPPORTED_PROTOCOL: &str = "system.unsupportedProtocol";
    pub const SUBJECT_TOO_LONG: &str = "system.subjectTooLong";
    pub const DELETED: &str = "system.deleted";
    pub const SUBSCRIPTION_LIMIT_EXCEEDED: &str = "system.subscriptionLimitExceeded";
    pub const DISPOSING: &str = "system.disposing";
    pub const DISPOSED_SUBSCRIPTION: &str = "system.disposedSubscription";

    // HTTP only
    pub const BAD_REQUEST: &str = "system.badRequest";
    pub const METHOD_NOT_ALLOWED: &str = "system.methodNotAllowed";
    pub const SERVICE_UNAVAILABLE: &str = "system.serviceUnavailable";
    pub const FORBIDDEN: &str = "system.forbidden";
    pub const NOT_IMPLEMENTED: &str = "system.notImplemented";
}

/// RES error with code, message and optional data
#[derive(Debug, Clone, PartialEq)]
pub struct ResError {
    /// Dot separated error code
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Optional additional data
    pub data: Option<serde_json::Value>,
}

impl ResError {
    /// Create a new error
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Check the error code
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }

    /// Access denied
    pub fn access_denied() -> Self {
        Self::new(codes::ACCESS_DENIED, "Access denied")
    }

    /// Internal error with details
    pub fn internal(details: impl fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, format!("Internal error: {}", details))
    }

    /// Internal error without details
    pub fn internal_error() -> Self {
        Self::new(codes::INTERNAL_ERROR, "Internal error")
    }

    /// Invalid parameters
    pub fn invalid_params() -> Self {
        Self::new(codes::INVALID_PARAMS, "Invalid parameters")
    }

    /// Invalid query
    pub fn invalid_query() -> Self {
        Self::new(codes::INVALID_QUERY, "Invalid query")
    }

    /// Method not found
    pub fn method_not_found() -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "Method not found")
    }

    /// No subscription for the resource
    pub fn no_subscription() -> Self {
        Self::new(codes::NO_SUBSCRIPTION, "No subscription")
    }

    /// Not found
    pub fn not_found() -> Self {
        Self::new(codes::NOT_FOUND, "Not found")
    }

    /// Request timeout
    pub fn timeout() -> Self {
        Self::new(codes::TIMEOUT, "Request timeout")
    }

    /// Invalid request
    pub fn invalid_request() -> Self {
        Self::new(codes::INVALID_REQUEST, "Invalid request")
    }

    /// Unsupported protocol version
    pub fn unsupported_protocol() -> Self {
        Self::new(codes::UNSUPPORTED_PROTOCOL, "Unsupported protocol")
    }

    /// Subject too long
    pub fn subject_too_long() -> Self {
        Self::new(codes::SUBJECT_TOO_LONG, "Subject too long")
    }

    /// Resource deleted
    pub fn deleted() -> Self {
        Self::new(codes::DELETED, "Deleted")
    }

    /// Too many subscriptions on one resource
    pub fn subscription_limit_exceeded() -> Self {
        Self::new(
            codes::SUBSCRIPTION_LIMIT_EXCEEDED,
            "Subscription limit exceeded",
        )
    }

    /// Connection is being disposed
    pub fn disposing() -> Self {
        Self::new(codes::DISPOSING, "Connection is being disposed")
    }

    /// Subscription was disposed while loading
    pub fn disposed_subscription() -> Self {
        Self::new(
            codes::DISPOSED_SUBSCRIPTION,
            "Resource subscription is disposed",
        )
    }

    /// Bad request
    pub fn bad_request(details: impl Into<String>) -> Self {
        Self::new(codes::BAD_REQUEST, details)
    }

    /// Method not allowed
    pub fn method_not_allowed() -> Self {
        Self::new(codes::METHOD_NOT_ALLOWED, "Method not allowed")
    }

    /// Service unavailable
    pub fn service_unavailable() -> Self {
        Self::new(codes::SERVICE_UNAVAILABLE, "Service unavailable")
    }

    /// Forbidden
    pub fn forbidden() -> Self {
        Self::new(codes::FORBIDDEN, "Forbidden")
    }

    pub fn not_implemented() -> Self {
        Self::new(codes::NOT_IMPLEMENTED, "Not implemented")
    }

    /// Origin not in the allowed list
    pub fn forbidden_origin() -> Self {
        Self::new(codes::FORBIDDEN, "Forbidden origin")
    }
}

impl fmt::Display for ResError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ResError {}

impl Serialize for ResError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let len = if self.data.is_some() { 3 } else { 2 };
        let mut state = serializer.serialize_struct("ResError", len)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if let Some(ref data) = self.data {
            state.serialize_field("data", data)?;
        }
        state.end()
    }
}

impl<'de> Deserialize<'de> for ResError {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ErrorHelper {
            code: String,
            #[serde(default)]
            message: String,
            data: Option<serde_json::Value>,
        }

        let helper = ErrorHelper::deserialize(deserializer)?;
        Ok(ResError {
            code: helper.code,
            message: helper.message,
            data: helper.data,
        })
    }
}

impl From<BusError> for ResError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::NoResponders => ResError::not_found(),
            BusError::Timeout => ResError::timeout(),
            BusError::SubjectTooLong => ResError::subject_too_long(),
            other => ResError::internal(other),
        }
    }
}

impl From<serde_json::Error> for ResError {
    fn from(e: serde_json::Error) -> Self {
        ResError::internal(e)
    }
}

/// Result type for RES operations
pub type ResResult<T> = Result<T, ResError>;

/// Gateway-level errors (startup and shutdown)
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::domain::config::ConfigError),

    /// Server socket bind error
    #[error("server bind error: {0}")]
    Bind(String),

    /// TLS setup error
    #[error("tls error: {0}")]
    Tls(String),

    /// Bus connection error
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Service already started
    #[error("service already started")]
    AlreadyStarted,

    /// Shutdown in progress
    #[error("shutdown in progress")]
    ShuttingDown,
}
