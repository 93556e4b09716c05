//! Client request parsing.
//!
//! Methods are `<action>.<rid>`, with `call` and `auth` carrying the
//! resource method after the last dot: `call.<rid>.<method>`.

use crate::domain::error::{ResError, ResResult};
use crate::domain::rid::{is_valid_rid, is_valid_rid_part};
use serde::Deserialize;
use thiserror::Error;

/// Request that cannot be answered at all
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("request is missing id property")]
    MissingId,
}

/// Parsed client action
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Version {
        protocol: String,
    },
    Get {
        rid: String,
    },
    Subscribe {
        rid: String,
    },
    Unsubscribe {
        rid: String,
        count: usize,
    },
    Call {
        rid: String,
        method: String,
        params: Option<serde_json::Value>,
    },
    Auth {
        rid: String,
        method: String,
        params: Option<serde_json::Value>,
    },
    New {
        rid: String,
        params: Option<serde_json::Value>,
    },
}

/// Request with its id; the action is an error to reply with when invalid
#[derive(Debug)]
pub struct Request {
    pub id: u64,
    pub action: ResResult<Action>,
}

#[derive(Deserialize)]
struct RawRequest {
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Option<serde_json::Value>,
    id: Option<u64>,
}

#[derive(Deserialize, Default)]
struct VersionParams {
    #[serde(default)]
    protocol: String,
}

#[derive(Deserialize, Default)]
struct UnsubscribeParams {
    count: Option<usize>,
}

/// Parse a request frame
pub fn parse_request(data: &[u8]) -> Result<Request, RequestError> {
    let raw: RawRequest = serde_json::from_slice(data)?;
    let id = raw.id.ok_or(RequestError::MissingId)?;
    Ok(Request {
        id,
        action: parse_action(raw.method, raw.params),
    })
}

fn params_or_default<T: for<'de> Deserialize<'de> + Default>(
    params: Option<serde_json::Value>,
) -> ResResult<T> {
    match params {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(p) => serde_json::from_value(p).map_err(|_| ResError::invalid_params()),
    }
}

fn parse_action(method: String, params: Option<serde_json::Value>) -> ResResult<Action> {
    let Some((action, rest)) = method.split_once('.') else {
        if method == "version" {
            let p: VersionParams = params_or_default(params)?;
            return Ok(Action::Version {
                protocol: p.protocol,
            });
        }
        return Err(ResError::invalid_request());
    };

    let (rid, resource_method) = if action == "call" || action == "auth" {
        let (rid, m) = rest.rsplit_once('.').ok_or_else(ResError::invalid_request)?;
        if !is_valid_rid_part(m) {
            return Err(ResError::invalid_request());
        }
        (rid, m)
    } else {
        (rest, "")
    };

    if !is_valid_rid(rid, true) {
        return Err(ResError::invalid_request());
    }
    let rid = rid.to_string();

    match action {
        "get" => Ok(Action::Get { rid }),
        "subscribe" => Ok(Action::Subscribe { rid }),
        "unsubscribe" => {
            let p: UnsubscribeParams = params_or_default(params)?;
            let count = p.count.unwrap_or(1);
            if count == 0 {
                return Err(ResError::invalid_params());
            }
            Ok(Action::Unsubscribe { rid, count })
        }
        "call" => Ok(Action::Call {
            rid,
            method: resource_method.to_string(),
            params,
        }),
        "auth" => Ok(Action::Auth {
            rid,
            method: resource_method.to_string(),
            params,
        }),
        "new" => Ok(Action::New { rid, params }),
        _ => Err(ResError::invalid_request()),
    }
}
