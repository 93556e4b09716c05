//! HTTP API request handler.

use super::encoding::{to_json, ApiEncoder};
use super::http_context;
use super::path::{path_to_rid, path_to_rid_action, rid_to_path};
use crate::codec::payloads::HeaderMap as MetaHeader;
use crate::codec::{CallResult, HttpContext, Meta};
use crate::conn::{Conn, ConnHandle};
use crate::domain::config::GatewayConfig;
use crate::domain::error::{codes, ResError, ResResult};
use crate::domain::rid::{is_valid_rid, is_valid_rid_part};
use crate::middleware::RequestTimer;
use crate::router::AppState;
use crate::rpc::version;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use tracing::{debug, error, trace, warn};

/// Headers a service may not set through a response meta
const PROTECTED_HEADERS: [&str; 5] = [
    "sec-websocket-extensions",
    "sec-websocket-protocol",
    "access-control-allow-credentials",
    "access-control-allow-origin",
    "content-type",
];

/// Successful outcome of a request on a temporary connection
enum Reply {
    /// Rendered resource or call result
    Content(serde_json::Value),
    /// Reference to a resource returned by a call
    Resource(String),
    NoContent,
    /// Nothing to render; the meta status decides the response
    Direct,
}

/// Handle any request below the API path
pub async fn api_handler(
    State(state): State<AppState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let timer = RequestTimer::new(state.ctx.metrics.clone(), method.as_str());
    let http = http_context(&headers, &uri, remote.map(|ConnectInfo(addr)| addr));
    let head = method == Method::HEAD;
    let response = handle(&state, &method, &uri, &headers, http, body).await;
    timer.finish();
    if head {
        let (parts, _) = response.into_parts();
        return Response::from_parts(parts, axum::body::Body::empty());
    }
    response
}

async fn handle(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    http: HttpContext,
    body: Bytes,
) -> Response {
    let config = &state.config;
    if let Err(err) = check_origin(config, headers) {
        return error_response(err);
    }

    let path = uri.path();
    let query = uri.query().unwrap_or("");
    let api_path = config.api_path.as_str();

    if path.len() > api_path.len() && path.ends_with('/') {
        return error_response(ResError::not_found());
    }

    let (rid, action) = match *method {
        Method::GET | Method::HEAD => {
            let rid = match path_to_rid(path, query, api_path) {
                Some(rid) if is_valid_rid(&rid, true) => rid,
                _ => return error_response(ResError::not_found()),
            };
            trace!(rid = %rid, "HTTP get");
            return get(state, http, rid).await;
        }
        Method::POST => match path_to_rid_action(path, query, api_path) {
            Some(pair) => pair,
            None => return error_response(ResError::not_found()),
        },
        _ => {
            let mapped = match *method {
                Method::PUT => config.put_method.as_ref(),
                Method::DELETE => config.delete_method.as_ref(),
                Method::PATCH => config.patch_method.as_ref(),
                _ => None,
            };
            let Some(action) = mapped else {
                return method_not_allowed(state);
            };
            match path_to_rid(path, query, api_path) {
                Some(rid) => (rid, action.clone()),
                None => return error_response(ResError::not_found()),
            }
        }
    };

    if !is_valid_rid(&rid, true) || !is_valid_rid_part(&action) {
        return error_response(ResError::not_found());
    }

    let params = match parse_body(&body) {
        Ok(params) => params,
        Err(err) => return error_response(err),
    };

    trace!(rid = %rid, action = %action, "HTTP call");
    let (handle, auth_meta) = match temporary_conn(state, http).await {
        Ok(pair) => pair,
        Err(response) => return response,
    };
    let (result, meta) = call(&handle, rid, action.clone(), params).await;
    handle.dispose().await;

    let href = match result {
        Ok(Reply::Resource(ref rid)) => rid_to_path(rid, &config.api_path),
        _ => String::new(),
    };
    let result = result.map_err(|err| {
        let mapped = matches!(*method, Method::PUT | Method::DELETE | Method::PATCH);
        if mapped && err.is(codes::METHOD_NOT_FOUND) {
            ResError::method_not_allowed()
        } else {
            err
        }
    });
    let status = if action == "new" {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    reply(state, Meta::merge(auth_meta, meta), &href, result, status)
}

/// Get a resource on a temporary connection and render it
async fn get(state: &AppState, http: HttpContext, rid: String) -> Response {
    let (handle, auth_meta) = match temporary_conn(state, http).await {
        Ok(pair) => pair,
        Err(response) => return response,
    };
    let api_path = state.config.api_path.clone();
    let (result, meta) = handle
        .request(move |c, tx| {
            let target = rid.clone();
            c.get_http_resource(&target, move |c, result, meta| {
                let direct = meta.as_ref().is_some_and(Meta::is_direct_response_status);
                let result = result.map(|()| {
                    if direct {
                        Reply::Direct
                    } else {
                        Reply::Content(ApiEncoder::new(c, &api_path).encode(&rid))
                    }
                });
                let _ = tx.send((result, meta));
            });
        })
        .await
        .unwrap_or_else(|| (Err(ResError::disposing()), None));
    handle.dispose().await;

    reply(state, Meta::merge(auth_meta, meta), "", result, StatusCode::OK)
}

/// Call a resource method on a temporary connection
async fn call(
    handle: &ConnHandle,
    rid: String,
    action: String,
    params: Option<serde_json::Value>,
) -> (ResResult<Reply>, Option<Meta>) {
    handle
        .request(move |c, tx| {
            c.call_http_resource(&rid, &action, params, move |_, result, meta| {
                let result = result.map(|r| match r {
                    None => Reply::Direct,
                    Some(CallResult::Resource(rid)) => Reply::Resource(rid),
                    Some(CallResult::Result(serde_json::Value::Null)) => Reply::NoContent,
                    Some(CallResult::Result(value)) => Reply::Content(value),
                });
                let _ = tx.send((result, meta));
            });
        })
        .await
        .unwrap_or_else(|| (Err(ResError::disposing()), None))
}

/// Spawn a connection for one request, running header auth first.
///
/// An auth meta with a direct response status ends the request with that
/// response; otherwise the auth meta is returned to be merged into the
/// final reply.
async fn temporary_conn(
    state: &AppState,
    http: HttpContext,
) -> Result<(ConnHandle, Option<Meta>), Response> {
    let handle = Conn::spawn(state.ctx.clone(), http, version::LATEST, None);
    let Some((rid, action)) = state.config.header_auth_method() else {
        return Ok((handle, None));
    };
    let (result, meta) = handle.authenticate(rid, action).await;
    if let Err(ref err) = result {
        debug!(cid = %handle.cid(), error = %err, "Header auth failed");
    }
    match meta {
        Some(meta) if meta.is_direct_response_status() => {
            handle.dispose().await;
            let href = match result {
                Ok(Some(ref rid)) => rid_to_path(rid, &state.config.api_path),
                _ => String::new(),
            };
            Err(status_response(&meta, &href, result.err()))
        }
        meta => Ok((handle, meta)),
    }
}

/// Write the final response of a request.
///
/// A valid direct response status in the meta takes precedence over the
/// result. Otherwise the meta headers are added to the regular response.
fn reply(
    state: &AppState,
    mut meta: Option<Meta>,
    href: &str,
    result: ResResult<Reply>,
    resource_status: StatusCode,
) -> Response {
    if let Some(m) = meta.as_mut().filter(|m| !m.is_valid_status()) {
        error!(status = ?m.status, "Invalid meta status");
        m.status = None;
    }
    if let Some(m) = meta.as_ref().filter(|m| m.is_direct_response_status()) {
        return status_response(m, href, result.err());
    }

    let mut response = match result {
        Err(err) if err.is(codes::METHOD_NOT_ALLOWED) => method_not_allowed(state),
        Err(err) => error_response(err),
        Ok(Reply::Content(value)) => json_response(StatusCode::OK, &value),
        Ok(Reply::NoContent) | Ok(Reply::Direct) => StatusCode::NO_CONTENT.into_response(),
        Ok(Reply::Resource(_)) => match HeaderValue::from_str(href) {
            Ok(location) => (resource_status, [(header::LOCATION, location)]).into_response(),
            Err(_) => error_response(ResError::internal("invalid location")),
        },
    };
    if let Some(meta) = meta {
        let location = response.headers_mut().remove(header::LOCATION);
        merge_meta_header(response.headers_mut(), &meta.header);
        if let Some(location) = location {
            response.headers_mut().insert(header::LOCATION, location);
        }
    }
    response
}

/// Response for a meta status that replaces the regular reply.
///
/// Redirects get `href` as location unless the meta sets one. Error statuses
/// carry `err`, or an error derived from the status.
pub(crate) fn status_response(meta: &Meta, href: &str, err: Option<ResError>) -> Response {
    let status = meta
        .status
        .and_then(|s| u16::try_from(s).ok())
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = if status.is_redirection() {
        let mut response = status.into_response();
        if !href.is_empty() && !meta.header.contains_key("Location") {
            if let Ok(location) = HeaderValue::from_str(href) {
                response.headers_mut().insert(header::LOCATION, location);
            }
        }
        response
    } else {
        let err = err.unwrap_or_else(|| status_error(status));
        json_response(status, &to_json(&err))
    };
    merge_meta_header(response.headers_mut(), &meta.header);
    response
}

/// RES error matching an HTTP error status
fn status_error(status: StatusCode) -> ResError {
    match status.as_u16() {
        401 | 402 | 407 => ResError::access_denied(),
        403 | 451 => ResError::forbidden(),
        404 | 410 => ResError::not_found(),
        405 => ResError::method_not_allowed(),
        408 | 504 => ResError::timeout(),
        501 => ResError::not_implemented(),
        503 => ResError::service_unavailable(),
        s if s < 500 => ResError::bad_request("Bad request"),
        _ => ResError::internal_error(),
    }
}

/// Add meta headers to a response. Values replace any existing ones, except
/// for `Set-Cookie` which is appended. Protected headers are skipped.
pub(crate) fn merge_meta_header(headers: &mut HeaderMap, meta: &MetaHeader) {
    for (key, values) in meta {
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            warn!(header = %key, "Invalid meta header name");
            continue;
        };
        if PROTECTED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if name != header::SET_COOKIE {
            headers.remove(&name);
        }
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => warn!(header = %key, "Invalid meta header value"),
            }
        }
    }
}

/// Reject requests from origins outside the allowed list.
///
/// Requests without an `Origin` header, or with `null`, are not from a CORS
/// enabled browser and are let through.
pub(crate) fn check_origin(config: &GatewayConfig, headers: &HeaderMap) -> ResResult<()> {
    let Some(allowed) = config.allowed_origins() else {
        return Ok(());
    };
    let Some(origin) = headers.get(header::ORIGIN).and_then(|o| o.to_str().ok()) else {
        return Ok(());
    };
    if origin == "null" || allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)) {
        return Ok(());
    }
    Err(ResError::forbidden_origin())
}

fn parse_body(body: &[u8]) -> ResResult<Option<serde_json::Value>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ResError::bad_request(format!("Error decoding request body: {}", e)))
}

/// HTTP status for a RES error
pub(crate) fn error_status(err: &ResError) -> StatusCode {
    match err.code.as_str() {
        codes::NOT_FOUND | codes::METHOD_NOT_FOUND | codes::TIMEOUT => StatusCode::NOT_FOUND,
        codes::ACCESS_DENIED => StatusCode::UNAUTHORIZED,
        codes::METHOD_NOT_ALLOWED => StatusCode::METHOD_NOT_ALLOWED,
        codes::INTERNAL_ERROR => StatusCode::INTERNAL_SERVER_ERROR,
        codes::SERVICE_UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
        codes::FORBIDDEN => StatusCode::FORBIDDEN,
        codes::SUBJECT_TOO_LONG => StatusCode::URI_TOO_LONG,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub(crate) fn error_response(err: ResError) -> Response {
    json_response(error_status(&err), &to_json(&err))
}

fn method_not_allowed(state: &AppState) -> Response {
    let mut response = error_response(ResError::method_not_allowed());
    if let Ok(allow) = HeaderValue::from_str(&state.config.allow_methods()) {
        response.headers_mut().insert(header::ALLOW, allow);
    }
    response
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response {
    (
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        )],
        value.to_string(),
    )
        .into_response()
}
