//! # Client Connections
//!
//! One [`Conn`] per websocket client or HTTP request. All state of a
//! connection is owned by a single tokio task; everything else talks to it
//! through a [`ConnHandle`] by enqueueing work.
//!
//! ```text
//!  socket reader ──┐
//!  cache callbacks ┼──▶ ConnHandle ──▶ [work queue] ──▶ Conn (worker task)
//!  conn.<cid>.*  ──┘                                      │
//!                                                         ▼
//!                                          OutFrame queue ──▶ socket writer
//! ```

mod connection;
mod gc;
mod subscription;

pub use connection::Conn;

use crate::codec::{CallResult, Meta};
use crate::domain::error::{ResError, ResResult};
use crate::middleware::metrics::GatewayMetrics;
use crate::rescache::ResourceCache;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Max frames waiting to be written before the client is dropped
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Unit of work run on a connection worker
pub type ConnWork = Box<dyn FnOnce(&mut Conn) + Send>;

/// Live connections by CID
pub type ConnRegistry = DashMap<String, ConnHandle>;

/// Frame written to the client socket
#[derive(Debug, Clone, PartialEq)]
pub enum OutFrame {
    Text(String),
    /// Close the socket with a reason
    Close(String),
}

/// Services shared by all connections
#[derive(Clone)]
pub struct ConnContext {
    pub cache: ResourceCache,
    pub metrics: Arc<GatewayMetrics>,
    pub registry: Arc<ConnRegistry>,
    /// Max direct subscriptions of one RID
    pub subscription_limit: usize,
    /// Max parallel get requests per subscription tree, 0 for no limit
    pub reference_throttle: usize,
}

impl ConnContext {
    pub fn new(cache: ResourceCache, metrics: Arc<GatewayMetrics>, subscription_limit: usize) -> Self {
        Self {
            cache,
            metrics,
            registry: Arc::new(DashMap::new()),
            subscription_limit,
            reference_throttle: 0,
        }
    }

    /// Limit parallel get requests while loading referenced resources
    pub fn with_reference_throttle(mut self, limit: usize) -> Self {
        self.reference_throttle = limit;
        self
    }
}

/// Cloneable handle to a connection worker
#[derive(Clone)]
pub struct ConnHandle {
    cid: Arc<str>,
    tx: mpsc::UnboundedSender<ConnWork>,
}

impl ConnHandle {
    /// Connection ID
    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Queue work on the connection.
    ///
    /// Returns false once the connection is disposed.
    pub fn enqueue(&self, f: impl FnOnce(&mut Conn) + Send + 'static) -> bool {
        self.tx.send(Box::new(f)).is_ok()
    }

    /// Queue an inbound client frame
    pub fn handle_message(&self, data: String) -> bool {
        self.enqueue(move |c| c.handle_request(data.as_bytes()))
    }

    /// Run `f` on the worker and wait for the value it sends back.
    ///
    /// Returns `None` if the connection is disposed before answering.
    pub async fn request<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Conn, oneshot::Sender<T>) + Send + 'static,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if !self.enqueue(move |c| f(c, tx)) {
            return None;
        }
        rx.await.ok()
    }

    /// Read connection state on the worker
    pub async fn inspect<T: Send + 'static>(
        &self,
        f: impl FnOnce(&Conn) -> T + Send + 'static,
    ) -> Option<T> {
        self.request(move |c, tx| {
            let _ = tx.send(f(c));
        })
        .await
    }

    /// Send an auth request with the connection's HTTP headers.
    ///
    /// The call result is discarded. Returns the resource reference of a
    /// resource response, if any, along with the response meta.
    pub async fn authenticate(
        &self,
        rid: &str,
        action: &str,
    ) -> (ResResult<Option<String>>, Option<Meta>) {
        let (rid, action) = (rid.to_string(), action.to_string());
        self.request(move |c, tx| {
            c.auth_no_result(&rid, &action, move |_, result, meta| {
                let result = result.map(|r| match r {
                    CallResult::Resource(rid) => Some(rid),
                    CallResult::Result(_) => None,
                });
                let _ = tx.send((result, meta));
            });
        })
        .await
        .unwrap_or_else(|| (Err(ResError::disposing()), None))
    }

    /// Dispose the connection and wait for it to finish
    pub async fn dispose(&self) {
        self.request(|c, tx| {
            c.dispose();
            let _ = tx.send(());
        })
        .await;
    }

    /// Close the client socket with a reason, then dispose
    pub async fn disconnect(&self, reason: &str) {
        let reason = reason.to_string();
        self.request(move |c, tx| {
            c.disconnect(&reason);
            let _ = tx.send(());
        })
        .await;
    }
}
