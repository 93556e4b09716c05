//! Request builders and response decoders for service traffic on the bus.

use super::value::{Collection, Model, Value};
use crate::domain::error::{ResError, ResResult};
use crate::domain::rid::is_valid_rid;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// HTTP headers forwarded with auth requests
pub type HeaderMap = BTreeMap<String, Vec<String>>;

fn missing_result() -> ResError {
    ResError::internal("response missing result")
}

fn invalid_response() -> ResError {
    ResError::internal("invalid service response")
}

/// Request sent to access, call and auth endpoints
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub query: String,
    pub cid: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_http: bool,
}

/// HTTP context of the connection making an auth request
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpContext {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header: HeaderMap,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    #[serde(flatten)]
    request: &'a Request,
    #[serde(flatten)]
    http: &'a HttpContext,
}

fn encode<T: Serialize>(value: &T) -> Bytes {
    // Serializing plain structs of strings and JSON values cannot fail.
    Bytes::from(serde_json::to_vec(value).unwrap_or_default())
}

/// Encode an access or call request
pub fn create_request(request: &Request) -> Bytes {
    encode(request)
}

/// Encode an auth request including the HTTP context
pub fn create_auth_request(request: &Request, http: &HttpContext) -> Bytes {
    encode(&AuthRequest { request, http })
}

/// Encode a get request
pub fn create_get_request(query: &str) -> Bytes {
    if query.is_empty() {
        return Bytes::from_static(b"{}");
    }
    encode(&serde_json::json!({ "query": query }))
}

/// Encode an event query request
pub fn create_event_query_request(query: &str) -> Bytes {
    encode(&serde_json::json!({ "query": query }))
}

fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> ResResult<T> {
    serde_json::from_slice(payload).map_err(ResError::from)
}

/// Initial content of a resource
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceData {
    Model(Model),
    Collection(Collection),
}

/// Decoded get response
#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub data: ResourceData,
    /// Normalized query, empty for non-query resources
    pub query: String,
}

#[derive(Deserialize)]
struct RawResponse<T> {
    result: Option<T>,
    error: Option<ResError>,
}

impl<T> RawResponse<T> {
    fn into_result(self) -> ResResult<T> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.result.ok_or_else(missing_result)
    }
}

#[derive(Deserialize)]
struct RawGetResult {
    model: Option<Model>,
    collection: Option<Collection>,
    #[serde(default)]
    query: String,
}

fn all_proper<'a>(mut values: impl Iterator<Item = &'a Value>) -> bool {
    values.all(Value::is_proper)
}

fn resource_data(model: Option<Model>, collection: Option<Collection>) -> ResResult<ResourceData> {
    match (model, collection) {
        (Some(model), None) if all_proper(model.values()) => Ok(ResourceData::Model(model)),
        (None, Some(collection)) if all_proper(collection.iter()) => {
            Ok(ResourceData::Collection(collection))
        }
        _ => Err(invalid_response()),
    }
}

/// Decode a get response
pub fn decode_get_response(payload: &[u8]) -> ResResult<GetResult> {
    let raw: RawResponse<RawGetResult> = decode(payload)?;
    let result = raw.into_result()?;
    Ok(GetResult {
        data: resource_data(result.model, result.collection)?,
        query: result.query,
    })
}

/// One event replayed by an event query
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventQueryEvent {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Decoded event query response
#[derive(Debug, Clone, PartialEq)]
pub enum EventQueryResult {
    Events(Vec<EventQueryEvent>),
    Data(ResourceData),
}

#[derive(Deserialize)]
struct RawEventQueryResult {
    events: Option<Vec<EventQueryEvent>>,
    model: Option<Model>,
    collection: Option<Collection>,
}

/// Decode an event query response
pub fn decode_event_query_response(payload: &[u8]) -> ResResult<EventQueryResult> {
    let raw: RawResponse<RawEventQueryResult> = decode(payload)?;
    let result = raw.into_result()?;
    match result.events {
        Some(events) => {
            if result.model.is_some() || result.collection.is_some() {
                return Err(invalid_response());
            }
            Ok(EventQueryResult::Events(events))
        }
        None if result.model.is_none() && result.collection.is_none() => {
            Ok(EventQueryResult::Events(Vec::new()))
        }
        None => Ok(EventQueryResult::Data(resource_data(
            result.model,
            result.collection,
        )?)),
    }
}

/// Access granted by a service
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AccessResult {
    #[serde(default)]
    pub get: bool,
    #[serde(default)]
    pub call: String,
}

/// Decode an access response, returning a service error as the error
pub fn decode_access_response(payload: &[u8]) -> ResResult<AccessResult> {
    let raw: RawResponse<AccessResult> = decode(payload)?;
    raw.into_result()
}

/// Decoded call or auth response
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    /// Plain result value
    Result(serde_json::Value),
    /// Resource reference response
    Resource(String),
}

#[derive(Deserialize)]
struct RidObject {
    rid: String,
}

#[derive(Deserialize)]
struct RawCallResponse {
    #[serde(default, deserialize_with = "present")]
    result: Option<serde_json::Value>,
    resource: Option<RidObject>,
    error: Option<ResError>,
}

// Keeps an explicit `null` result distinguishable from a missing one.
fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// Decode a call or auth response
pub fn decode_call_response(payload: &[u8]) -> ResResult<CallResult> {
    let raw: RawCallResponse = decode(payload)?;
    if let Some(err) = raw.error {
        return Err(err);
    }
    if let Some(resource) = raw.resource {
        if !is_valid_rid(&resource.rid, true) {
            return Err(invalid_response());
        }
        return Ok(CallResult::Resource(resource.rid));
    }
    raw.result.map(CallResult::Result).ok_or_else(missing_result)
}

/// Detect a legacy `new` result of the form `{"rid": "..."}`.
pub fn try_decode_legacy_new_result(result: &serde_json::Value) -> ResResult<Option<String>> {
    let Some(obj) = result.as_object() else {
        return Ok(None);
    };
    if obj.len() != 1 {
        return Ok(None);
    }
    match obj.get("rid").and_then(|v| v.as_str()) {
        Some(rid) if is_valid_rid(rid, true) => Ok(Some(rid.to_string())),
        Some(_) => Err(invalid_response()),
        None => Ok(None),
    }
}

/// Parse an event payload; an empty payload is `null`.
pub fn decode_event(payload: &[u8]) -> ResResult<serde_json::Value> {
    if payload.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    decode(payload)
}

/// Model change event data
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeEvent {
    pub values: BTreeMap<String, Value>,
}

/// Collection add event data
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddEvent {
    pub idx: i64,
    pub value: Value,
}

/// Collection remove event data
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoveEvent {
    pub idx: i64,
}

/// Query event data
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueryEvent {
    #[serde(default)]
    pub subject: String,
}

/// Connection token event data
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnTokenEvent {
    #[serde(default)]
    pub token: serde_json::Value,
}

/// System reset event data
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SystemReset {
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub access: Vec<String>,
}

/// Decode change event data
pub fn decode_change_event(data: &serde_json::Value) -> ResResult<ChangeEvent> {
    ChangeEvent::deserialize(data).map_err(ResError::from)
}

/// Decode add event data, rejecting a delete value
pub fn decode_add_event(data: &serde_json::Value) -> ResResult<AddEvent> {
    let ev = AddEvent::deserialize(data).map_err(ResError::from)?;
    if !ev.value.is_proper() {
        return Err(ResError::internal("invalid value"));
    }
    Ok(ev)
}

/// Decode remove event data
pub fn decode_remove_event(data: &serde_json::Value) -> ResResult<RemoveEvent> {
    RemoveEvent::deserialize(data).map_err(ResError::from)
}

/// Decode query event data
pub fn decode_query_event(data: &serde_json::Value) -> ResResult<QueryEvent> {
    QueryEvent::deserialize(data).map_err(ResError::from)
}

/// Decode a connection token event
pub fn decode_conn_token_event(payload: &[u8]) -> ResResult<ConnTokenEvent> {
    decode(payload)
}

/// Decode a system reset event; an empty payload resets nothing.
pub fn decode_system_reset(payload: &[u8]) -> ResResult<SystemReset> {
    if payload.is_empty() {
        return Ok(SystemReset::default());
    }
    decode(payload)
}

/// Encode change event data
pub fn encode_change_event(values: &BTreeMap<String, Value>) -> serde_json::Value {
    serde_json::json!({ "values": values })
}

/// Encode add event data
pub fn encode_add_event(idx: usize, value: &Value) -> serde_json::Value {
    serde_json::json!({ "idx": idx, "value": value })
}

/// Encode remove event data
pub fn encode_remove_event(idx: usize) -> serde_json::Value {
    serde_json::json!({ "idx": idx })
}
