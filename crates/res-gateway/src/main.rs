//! # res-gateway
//!
//! Realtime resource gateway binary.
//!
//! ## Startup Sequence
//!
//! 1. Parse command line flags
//! 2. Load the config file, if any, and apply flag overrides
//! 3. Initialize logging
//! 4. Connect to NATS and start serving
//! 5. Run until Ctrl+C or the bus connection is lost

use anyhow::{Context, Result};
use clap::Parser;
use res_bus::NatsBus;
use res_gateway::telemetry::{init_tracing, TelemetryConfig};
use res_gateway::{GatewayConfig, GatewayService};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Realtime API gateway for RES services
#[derive(Debug, Parser)]
#[command(name = "res-gateway", version, about)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// NATS server URL
    #[arg(short = 'n', long)]
    nats: Option<String>,

    /// Bind address
    #[arg(short = 'i', long)]
    addr: Option<IpAddr>,

    /// Port for websocket and HTTP traffic
    #[arg(short, long)]
    port: Option<u16>,

    /// Path for websocket upgrades
    #[arg(short, long)]
    wspath: Option<String>,

    /// Path prefix for HTTP resource access
    #[arg(short, long)]
    apipath: Option<String>,

    /// Resource method for header authentication
    #[arg(long)]
    headauth: Option<String>,

    /// Allowed origins, `*` or `;` separated
    #[arg(long)]
    origin: Option<String>,

    /// Call method mapped to HTTP PUT
    #[arg(long)]
    putmethod: Option<String>,

    /// Call method mapped to HTTP DELETE
    #[arg(long)]
    deletemethod: Option<String>,

    /// Call method mapped to HTTP PATCH
    #[arg(long)]
    patchmethod: Option<String>,

    /// Serve over TLS
    #[arg(long)]
    tls: bool,

    /// TLS certificate file
    #[arg(long)]
    tlscert: Option<PathBuf>,

    /// TLS key file
    #[arg(long)]
    tlskey: Option<PathBuf>,

    /// Timeout in milliseconds for requests on the bus
    #[arg(short = 'r', long)]
    reqtimeout: Option<u64>,

    /// Max direct subscriptions per resource on one connection
    #[arg(long)]
    sublimit: Option<u32>,

    /// Limit on parallel requests sent in response to a system reset
    #[arg(long)]
    resetthrottle: Option<usize>,

    /// Limit on parallel requests sent when following resource references
    #[arg(long)]
    referencethrottle: Option<usize>,

    /// Enable websocket per message compression
    #[arg(long)]
    wscompression: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Apply flags on top of a loaded configuration
    fn apply(self, config: &mut GatewayConfig) {
        if let Some(v) = self.nats {
            config.nats_url = v;
        }
        if let Some(v) = self.addr {
            config.addr = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.wspath {
            config.ws_path = v;
        }
        if let Some(v) = self.apipath {
            config.api_path = v;
        }
        if let Some(v) = self.headauth {
            config.header_auth = Some(v);
        }
        if let Some(v) = self.origin {
            config.allow_origin = v;
        }
        if let Some(v) = self.putmethod {
            config.put_method = Some(v);
        }
        if let Some(v) = self.deletemethod {
            config.delete_method = Some(v);
        }
        if let Some(v) = self.patchmethod {
            config.patch_method = Some(v);
        }
        if self.tls {
            config.tls = true;
        }
        if let Some(v) = self.tlscert {
            config.cert_file = Some(v);
        }
        if let Some(v) = self.tlskey {
            config.key_file = Some(v);
        }
        if let Some(ms) = self.reqtimeout {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = self.sublimit {
            config.subscription_limit = v;
        }
        if let Some(v) = self.resetthrottle {
            config.reset_throttle = v;
        }
        if let Some(v) = self.referencethrottle {
            config.reference_throttle = v;
        }
        if self.wscompression {
            config.ws_compression = true;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        if self.json_logs {
            config.json_logs = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => GatewayConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    cli.apply(&mut config);

    init_tracing(&TelemetryConfig::new(&config.log_level, config.json_logs))
        .context("initializing logging")?;

    let bus = Arc::new(NatsBus::with_timeout(&config.nats_url, config.request_timeout));
    let mut service = GatewayService::new(config, bus).context("invalid configuration")?;
    service.start().await.context("starting gateway")?;

    info!("Gateway is running. Press Ctrl+C to stop.");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("Received shutdown signal");
        }
        _ = service.closed() => {
            warn!("Bus connection closed, shutting down");
        }
    }

    service.stop().await;
    Ok(())
}
