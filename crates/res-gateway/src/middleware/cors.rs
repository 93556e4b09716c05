//! CORS layer for the HTTP API.
//!
//! Wrapper around tower-http CORS driven by `allowOrigin` and the
//! configured HTTP verb mappings.

use crate::domain::config::GatewayConfig;
use axum::http::{HeaderName, HeaderValue, Method};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Methods allowed on the API, reflecting configured verb mappings
pub fn allowed_methods(config: &GatewayConfig) -> Vec<Method> {
    let mut methods = vec![Method::GET, Method::HEAD, Method::OPTIONS, Method::POST];
    if config.put_method.is_some() {
        methods.push(Method::PUT);
    }
    if config.delete_method.is_some() {
        methods.push(Method::DELETE);
    }
    if config.patch_method.is_some() {
        methods.push(Method::PATCH);
    }
    methods
}

/// Create the CORS layer from gateway config
pub fn create_cors_layer(config: &GatewayConfig) -> CorsLayer {
    let origin = match config.allowed_origins() {
        None => AllowOrigin::any(),
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect();
            AllowOrigin::list(origins)
        }
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(allowed_methods(config))
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static("location")])
        .max_age(Duration::from_secs(3600))
}
