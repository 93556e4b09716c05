//! HTTP routing for the gateway.
//!
//! ```text
//!  <wsPath>         ──▶ websocket upgrade
//!  <apiPath>*path   ──▶ HTTP API (any verb)
//!  /metrics         ──▶ Prometheus text exposition
//! ```

use crate::api::api_handler;
use crate::conn::ConnContext;
use crate::domain::config::GatewayConfig;
use crate::middleware::{create_cors_layer, GatewayMetrics};
use crate::ws::{ws_handler, WebSocketConfig};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub ctx: ConnContext,
    pub ws: WebSocketConfig,
}

impl AppState {
    pub fn new(config: GatewayConfig, ctx: ConnContext) -> Self {
        Self {
            config: Arc::new(config),
            ctx,
            ws: WebSocketConfig::default(),
        }
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.ctx.metrics
    }
}

/// Build the gateway router
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();
    let api_wildcard = format!("{}*path", config.api_path);

    Router::new()
        .route(&config.ws_path, get(ws_handler))
        .route(&config.api_path, any(api_handler))
        .route(&api_wildcard, any(api_handler))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(create_cors_layer(&config)),
        )
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let metrics = state.metrics();
    metrics.set_cache_hubs(state.ctx.cache.hub_count());
    match metrics.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
