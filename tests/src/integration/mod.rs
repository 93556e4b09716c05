//! # Integration Flows
//!
//! Every flow runs a real resource cache and real connection workers
//! against [`MemoryBus`]; the test plays the part of the services by
//! answering bus requests and publishing events.
//!
//! ```text
//!  test ──frames──▶ ConnHandle ──▶ Conn ──▶ ResourceCache ──▶ MemoryBus
//!   ▲                                                          │
//!   └────────────── OutFrame ◀───────── events ◀── test publishes
//! ```

pub mod http_flows;
pub mod lifecycle_flows;
pub mod resource_flows;

use res_bus::MemoryBus;
use res_gateway::rpc::version;
use res_gateway::{
    build_router, AppState, CacheOptions, Conn, ConnContext, ConnHandle, GatewayConfig,
    GatewayMetrics, OutFrame, ResourceCache,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Time to wait for a frame before failing a test
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// A started cache and connection context on an in-memory bus
pub struct Gateway {
    pub bus: Arc<MemoryBus>,
    pub ctx: ConnContext,
}

impl Gateway {
    pub fn start() -> Self {
        Self::with_limit(256)
    }

    pub fn with_limit(subscription_limit: usize) -> Self {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let cache = ResourceCache::new(bus.clone(), CacheOptions::default(), metrics.clone());
        cache.start().expect("cache start");
        Self {
            bus,
            ctx: ConnContext::new(cache, metrics, subscription_limit),
        }
    }

    /// Open a websocket-style client speaking the latest protocol
    pub fn client(&self) -> Client {
        let (tx, out) = mpsc::channel(64);
        let handle = Conn::spawn(
            self.ctx.clone(),
            Default::default(),
            version::LATEST,
            Some(tx),
        );
        Client { handle, out }
    }

    /// HTTP router serving the same cache
    pub fn router(&self) -> axum::Router {
        build_router(AppState::new(GatewayConfig::default(), self.ctx.clone()))
    }

    /// Answer the next request on `subject`
    pub async fn respond(&self, subject: &str, payload: Value) {
        let request = self
            .bus
            .next_request(subject)
            .await
            .unwrap_or_else(|| panic!("no request on {}", subject));
        request.respond(payload.to_string());
    }

    /// Grant get access on `rid` for the next access request
    pub async fn grant(&self, rid: &str) {
        self.respond(
            &format!("access.{}", rid),
            serde_json::json!({"result": {"get": true}}),
        )
        .await;
    }
}

/// Client end of a connection
pub struct Client {
    pub handle: ConnHandle,
    out: mpsc::Receiver<OutFrame>,
}

impl Client {
    pub fn send(&self, frame: Value) {
        assert!(self.handle.handle_message(frame.to_string()), "connection closed");
    }

    pub async fn next_frame(&mut self) -> Value {
        match self.next_out().await {
            OutFrame::Text(text) => serde_json::from_str(&text).expect("frame is json"),
            OutFrame::Close(reason) => panic!("unexpected close: {}", reason),
        }
    }

    /// Next raw frame, including close frames
    pub async fn next_out(&mut self) -> OutFrame {
        tokio::time::timeout(FRAME_TIMEOUT, self.out.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("output closed")
    }

    /// Assert no frame is pending once queued work has drained
    pub async fn assert_quiet(&mut self) {
        self.sync().await;
        assert!(
            self.out.try_recv().is_err(),
            "unexpected frame pending"
        );
    }

    /// Wait until the connection worker has drained its queue
    pub async fn sync(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        self.handle.inspect(|_| ()).await;
    }

    /// Direct and indirect counts of a subscription
    pub async fn counts(&self, rid: &str) -> Option<(usize, usize)> {
        let rid = rid.to_string();
        self.handle
            .inspect(move |c| c.subscription_counts(&rid))
            .await
            .flatten()
    }

    pub async fn rids(&self) -> Vec<String> {
        self.handle
            .inspect(|c| c.subscription_rids())
            .await
            .unwrap_or_default()
    }
}
