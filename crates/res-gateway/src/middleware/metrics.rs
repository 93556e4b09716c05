//! Prometheus metrics for the gateway.
//!
//! All metrics follow the naming convention: `res_<area>_<metric>_<unit>`
//!
//! Each [`GatewayMetrics`] owns its registry, so several gateways (or
//! tests) in one process never collide on registration.

use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

/// Client RPC methods counted separately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMethod {
    Get,
    Subscribe,
    Unsubscribe,
    Call,
    Auth,
    New,
}

impl WsMethod {
    fn label(self) -> &'static str {
        match self {
            WsMethod::Get => "get",
            WsMethod::Subscribe => "subscribe",
            WsMethod::Unsubscribe => "unsubscribe",
            WsMethod::Call => "call",
            WsMethod::Auth => "auth",
            WsMethod::New => "new",
        }
    }
}

/// Gateway metrics
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,

    // WebSocket connections
    pub ws_connections: IntGauge,
    pub ws_connections_total: IntCounter,
    pub ws_requests: IntCounterVec,

    // HTTP requests
    pub http_requests: IntCounterVec,
    pub http_request_duration: Histogram,

    // Cache and bus
    pub cache_hubs: IntGauge,
    pub bus_requests: IntCounter,
    pub bus_events: IntCounter,
}

impl GatewayMetrics {
    /// Create and register every metric in a fresh registry
    pub fn try_new() -> prometheus::Result<Self> {
        let metrics = Self {
            registry: Registry::new(),
            ws_connections: IntGauge::new(
                "res_ws_connections",
                "Number of open websocket connections",
            )?,
            ws_connections_total: IntCounter::new(
                "res_ws_connections_total",
                "Total websocket connections accepted",
            )?,
            ws_requests: IntCounterVec::new(
                Opts::new("res_ws_requests_total", "Client requests by method"),
                &["method"],
            )?,
            http_requests: IntCounterVec::new(
                Opts::new("res_http_requests_total", "HTTP API requests by verb"),
                &["method"],
            )?,
            http_request_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "res_http_request_duration_seconds",
                    "Time spent serving HTTP API requests",
                )
                .buckets(exponential_buckets(0.001, 2.0, 14)?),
            )?,
            cache_hubs: IntGauge::new("res_cache_hubs", "Number of cached resource names")?,
            bus_requests: IntCounter::new(
                "res_bus_requests_total",
                "Total requests sent on the bus",
            )?,
            bus_events: IntCounter::new(
                "res_bus_events_total",
                "Total resource events received from the bus",
            )?,
        };

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(metrics.ws_connections.clone()),
            Box::new(metrics.ws_connections_total.clone()),
            Box::new(metrics.ws_requests.clone()),
            Box::new(metrics.http_requests.clone()),
            Box::new(metrics.http_request_duration.clone()),
            Box::new(metrics.cache_hubs.clone()),
            Box::new(metrics.bus_requests.clone()),
            Box::new(metrics.bus_events.clone()),
        ];
        for collector in collectors {
            metrics.registry.register(collector)?;
        }
        Ok(metrics)
    }

    pub fn new() -> Self {
        Self::try_new().expect("metric creation failed")
    }

    /// Record an accepted websocket connection
    pub fn record_ws_connect(&self) {
        self.ws_connections.inc();
        self.ws_connections_total.inc();
    }

    /// Record a closed websocket connection
    pub fn record_ws_disconnect(&self) {
        if self.ws_connections.get() > 0 {
            self.ws_connections.dec();
        }
    }

    /// Record a websocket request
    pub fn record_ws_request(&self, method: WsMethod) {
        self.ws_requests.with_label_values(&[method.label()]).inc();
    }

    /// Record an HTTP API request by verb
    pub fn record_http_request(&self, method: &str, seconds: f64) {
        let verb = match method {
            "GET" | "HEAD" => "get",
            "POST" => "post",
            _ => "other",
        };
        self.http_requests.with_label_values(&[verb]).inc();
        self.http_request_duration.observe(seconds);
    }

    /// Record a request sent on the bus
    pub fn record_bus_request(&self) {
        self.bus_requests.inc();
    }

    /// Record an event received from the bus
    pub fn record_bus_event(&self) {
        self.bus_events.inc();
    }

    /// Set the number of cached hubs
    pub fn set_cache_hubs(&self, count: usize) {
        self.cache_hubs.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Encode all metrics as Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics")
            .field("ws_connections", &self.ws_connections.get())
            .field("cache_hubs", &self.cache_hubs.get())
            .finish_non_exhaustive()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request timing helper
pub struct RequestTimer {
    start: Instant,
    metrics: Arc<GatewayMetrics>,
    method: String,
}

impl RequestTimer {
    pub fn new(metrics: Arc<GatewayMetrics>, method: &str) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            method: method.to_string(),
        }
    }

    pub fn finish(self) {
        let seconds = self.start.elapsed().as_secs_f64();
        self.metrics.record_http_request(&self.method, seconds);
    }
}
