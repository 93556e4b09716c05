//! Gateway service lifecycle.
//!
//! ```text
//!  new ──▶ start ──▶ (serving) ──▶ stop
//!           │  connect bus
//!           │  start cache workers
//!           │  bind listener (TLS optional)
//!           ▼
//!     bus closed ──▶ closed() resolves, caller stops the service
//! ```

use crate::conn::{ConnContext, ConnHandle};
use crate::domain::config::GatewayConfig;
use crate::domain::error::GatewayError;
use crate::middleware::GatewayMetrics;
use crate::rescache::{CacheOptions, ResourceCache};
use crate::router::{build_router, AppState};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use res_bus::{BusClient, BusError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Time given to connections and in-flight requests on shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Close reason sent to websocket clients on shutdown
pub const SHUTDOWN_REASON: &str = "Server is shutting down";

struct Server {
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
    local_addr: SocketAddr,
}

/// Gateway service
pub struct GatewayService {
    config: GatewayConfig,
    bus: Arc<dyn BusClient>,
    metrics: Arc<GatewayMetrics>,
    ctx: ConnContext,
    server: Option<Server>,
    closed_tx: watch::Sender<bool>,
    stopping: bool,
}

impl GatewayService {
    /// Create a stopped service.
    ///
    /// The configuration is validated and normalized.
    pub fn new(mut config: GatewayConfig, bus: Arc<dyn BusClient>) -> Result<Self, GatewayError> {
        config.validate()?;

        let metrics = Arc::new(GatewayMetrics::new());
        let cache = ResourceCache::new(bus.clone(), CacheOptions::from(&config), metrics.clone());
        let ctx = ConnContext::new(cache, metrics.clone(), config.subscription_limit as usize)
            .with_reference_throttle(config.reference_throttle);
        let (closed_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            bus,
            metrics,
            ctx,
            server: None,
            closed_tx,
            stopping: false,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr)
    }

    /// Number of open client connections
    pub fn connection_count(&self) -> usize {
        self.ctx.registry.len()
    }

    /// Connect the bus, start the cache and begin serving
    pub async fn start(&mut self) -> Result<(), GatewayError> {
        if self.server.is_some() {
            return Err(GatewayError::AlreadyStarted);
        }
        if self.stopping {
            return Err(GatewayError::ShuttingDown);
        }
        info!("Starting res-gateway");
        if self.config.ws_compression {
            // No permessage-deflate support in the websocket stack
            warn!("wsCompression is set; websocket frames are sent uncompressed");
        }

        self.bus.connect().await?;
        let closed_tx = self.closed_tx.clone();
        self.bus.set_closed_handler(Arc::new(move |err: BusError| {
            error!(error = %err, "Bus connection lost");
            let _ = closed_tx.send(true);
        }));
        self.ctx.cache.start()?;

        let router = build_router(AppState::new(self.config.clone(), self.ctx.clone()));
        let app = router.into_make_service_with_connect_info::<SocketAddr>();

        let addr = self.config.bind_addr();
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| GatewayError::Bind(format!("{}: {}", addr, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| GatewayError::Bind(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind(e.to_string()))?;

        let handle = Handle::new();
        let task = match (&self.config.cert_file, &self.config.key_file) {
            (Some(cert), Some(key)) if self.config.tls => {
                let tls = RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| GatewayError::Tls(e.to_string()))?;
                let server = axum_server::from_tcp_rustls(listener, tls).handle(handle.clone());
                tokio::spawn(async move { server.serve(app).await })
            }
            _ => {
                let server = axum_server::from_tcp(listener).handle(handle.clone());
                tokio::spawn(async move { server.serve(app).await })
            }
        };

        info!(
            addr = %local_addr,
            scheme = self.config.scheme(),
            ws_path = %self.config.ws_path,
            api_path = %self.config.api_path,
            "Listening"
        );
        self.server = Some(Server {
            handle,
            task,
            local_addr,
        });
        Ok(())
    }

    /// Resolves once the bus connection is lost
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Disconnect all clients, stop serving and close the bus
    pub async fn stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        info!("Stopping res-gateway");

        let conns: Vec<ConnHandle> = self.ctx.registry.iter().map(|e| e.value().clone()).collect();
        let disconnect = futures::future::join_all(
            conns.iter().map(|c| c.disconnect(SHUTDOWN_REASON)),
        );
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, disconnect).await.is_err() {
            warn!(
                remaining = self.ctx.registry.len(),
                "Timed out waiting for connections to close"
            );
        }

        if let Some(server) = self.server.take() {
            server.handle.graceful_shutdown(Some(SHUTDOWN_TIMEOUT));
            match tokio::time::timeout(SHUTDOWN_TIMEOUT * 2, server.task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!(error = %e, "Server error"),
                Ok(Err(e)) => error!(error = %e, "Server task failed"),
                Err(_) => warn!("Timed out waiting for server to stop"),
            }
        }

        self.ctx.cache.stop();
        self.bus.close();
        info!("res-gateway stopped");
    }
}
