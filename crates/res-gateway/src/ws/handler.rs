//! Websocket handler for realtime clients.
//!
//! Each socket is split in two tasks:
//! - the reader forwards text frames to the connection worker
//! - the writer drains the connection's outbound frame queue
//!
//! Closing either side ends the session and disposes the connection.

use crate::api::handler::{check_origin, error_response, merge_meta_header, status_response};
use crate::api::http_context;
use crate::api::path::rid_to_path;
use crate::codec::Meta;
use crate::conn::{Conn, ConnHandle, OutFrame, OUTBOUND_QUEUE_SIZE};
use crate::router::AppState;
use crate::rpc::version;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default maximum message size (1MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Websocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Upgrade a request on the websocket path
pub async fn ws_handler(
    State(state): State<AppState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = check_origin(&state.config, &headers) {
        debug!(error = %err, "Websocket origin rejected");
        return error_response(err);
    }
    let http = http_context(&headers, &uri, remote.map(|ConnectInfo(addr)| addr));
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
    let handle = Conn::spawn(state.ctx.clone(), http, version::LEGACY, Some(out_tx));

    let mut meta = None;
    if let Some((rid, action)) = state.config.header_auth_method() {
        match header_auth(&handle, rid, action, &state.config.api_path).await {
            Ok(auth_meta) => meta = auth_meta,
            Err(response) => {
                handle.dispose().await;
                return response;
            }
        }
    }

    let failed = handle.clone();
    let mut response = ws
        .max_message_size(state.ws.max_message_size)
        .on_failed_upgrade(move |err| {
            debug!(cid = %failed.cid(), error = %err, "Websocket upgrade failed");
            tokio::spawn(async move { failed.dispose().await });
        })
        .on_upgrade(move |socket| serve(state, handle, out_rx, socket));
    if let Some(meta) = meta {
        merge_meta_header(response.headers_mut(), &meta.header);
    }
    response
}

/// Run header auth before upgrading.
///
/// An auth meta with a direct response status rejects the upgrade with that
/// response. Otherwise any meta is returned so its headers can be added to
/// the upgrade response.
async fn header_auth(
    handle: &ConnHandle,
    rid: &str,
    action: &str,
    api_path: &str,
) -> Result<Option<Meta>, Response> {
    let (result, mut meta) = handle.authenticate(rid, action).await;
    if let Err(ref err) = result {
        debug!(cid = %handle.cid(), error = %err, "Header auth failed");
    }
    if let Some(m) = meta.as_mut().filter(|m| !m.is_valid_status()) {
        error!(cid = %handle.cid(), status = ?m.status, "Invalid websocket meta status");
        m.status = None;
    }
    match meta {
        Some(meta) if meta.is_direct_response_status() => {
            let href = match result {
                Ok(Some(ref rid)) => rid_to_path(rid, api_path),
                _ => String::new(),
            };
            Err(status_response(&meta, &href, result.err()))
        }
        meta => Ok(meta),
    }
}

async fn serve(
    state: AppState,
    handle: ConnHandle,
    out_rx: mpsc::Receiver<OutFrame>,
    socket: WebSocket,
) {
    let metrics = state.ctx.metrics.clone();
    metrics.record_ws_connect();
    let cid = handle.cid().to_string();
    info!(cid = %cid, "Websocket connection opened");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, out_rx));
    read_loop(stream, &handle).await;

    handle.dispose().await;
    if let Err(e) = writer.await {
        warn!(cid = %cid, error = %e, "Websocket writer failed");
    }
    metrics.record_ws_disconnect();
    info!(cid = %cid, "Websocket connection closed");
}

async fn read_loop(mut stream: SplitStream<WebSocket>, handle: &ConnHandle) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!(cid = %handle.cid(), "Dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                debug!(cid = %handle.cid(), "Websocket close received");
                break;
            }
            Err(e) => {
                debug!(cid = %handle.cid(), error = %e, "Websocket read error");
                break;
            }
        };
        if !handle.handle_message(text) {
            break;
        }
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<OutFrame>) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutFrame::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            OutFrame::Close(reason) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HttpContext;
    use crate::conn::ConnContext;
    use crate::domain::config::GatewayConfig;
    use crate::middleware::GatewayMetrics;
    use crate::rescache::{CacheOptions, ResourceCache};
    use crate::router::build_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use res_bus::MemoryBus;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state(config: GatewayConfig) -> AppState {
        let metrics = Arc::new(GatewayMetrics::new());
        let cache = ResourceCache::new(Arc::new(MemoryBus::new()), CacheOptions::default(), metrics.clone());
        AppState::new(config, ConnContext::new(cache, metrics, 256))
    }

    #[test]
    fn test_default_config() {
        let config = WebSocketConfig::default();
        assert_eq!(config.max_message_size, 1024 * 1024);
    }

    #[tokio::test]
    async fn test_header_auth_meta_status_rejects_upgrade() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let cache = ResourceCache::new(bus.clone(), CacheOptions::default(), metrics.clone());
        cache.start().unwrap();
        let ctx = ConnContext::new(cache, metrics, 256);
        let handle = Conn::spawn(ctx, HttpContext::default(), version::LEGACY, None);

        let auth = tokio::spawn({
            let handle = handle.clone();
            async move { header_auth(&handle, "auth.header", "login", "/api").await }
        });
        let request = bus.next_request("auth.auth.header.login").await.unwrap();
        request.respond(
            r#"{"error":{"code":"system.accessDenied","message":"Access denied"},"meta":{"status":401,"header":{"www-authenticate":["Basic"]}}}"#,
        );

        let Err(response) = auth.await.unwrap() else {
            panic!("expected a direct response");
        };
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["www-authenticate"], "Basic");
    }

    #[tokio::test]
    async fn test_header_auth_meta_headers_are_kept() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let cache = ResourceCache::new(bus.clone(), CacheOptions::default(), metrics.clone());
        cache.start().unwrap();
        let ctx = ConnContext::new(cache, metrics, 256);
        let handle = Conn::spawn(ctx, HttpContext::default(), version::LEGACY, None);

        let auth = tokio::spawn({
            let handle = handle.clone();
            async move { header_auth(&handle, "auth.header", "login", "/api").await }
        });
        let request = bus.next_request("auth.auth.header.login").await.unwrap();
        request.respond(r#"{"result":null,"meta":{"status":200,"header":{"Set-Cookie":["s=1"]}}}"#);

        // Not a status a service may set; the headers still apply
        let Ok(Some(meta)) = auth.await.unwrap() else {
            panic!("expected auth meta");
        };
        assert_eq!(meta.status, None);
        assert_eq!(meta.header["Set-Cookie"], vec!["s=1"]);
    }

    #[tokio::test]
    async fn test_plain_get_is_rejected() {
        let router = build_router(state(GatewayConfig::default()));
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
