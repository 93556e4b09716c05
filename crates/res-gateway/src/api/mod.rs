//! HTTP API for one-shot resource access.
//!
//! ```text
//!  GET  /api/library/books/1        ──▶ get  library.books.1
//!  POST /api/library/books/new      ──▶ call library.books.new
//!  PUT  /api/library/books/1        ──▶ call library.books.1.<putMethod>
//! ```
//!
//! Every request runs on a temporary connection that is disposed once the
//! response is produced.

pub mod encoding;
pub mod handler;
pub mod path;

pub use encoding::ApiEncoder;
pub use handler::api_handler;
pub use path::{path_to_rid, path_to_rid_action, rid_to_path};

use crate::codec::{HeaderMap, HttpContext};
use axum::http::{self, Uri};
use std::net::SocketAddr;

/// HTTP context sent with auth requests.
///
/// Header names are canonicalized as `Content-Type`, `X-Forwarded-For`.
pub fn http_context(headers: &http::HeaderMap, uri: &Uri, remote: Option<SocketAddr>) -> HttpContext {
    let mut header = HeaderMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        header
            .entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(value.to_string());
    }

    let host = headers
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    HttpContext {
        header,
        host,
        remote_addr: remote.map(|a| a.to_string()).unwrap_or_default(),
        uri: uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_default(),
    }
}

fn canonical_header_key(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let c = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            c
        })
        .collect()
}
