//! Outbound frames and result payloads.

use crate::domain::error::ResError;
use serde::Serialize;
use std::collections::BTreeMap;

/// Resources sent to a client, keyed by RID
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Resources {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub models: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub collections: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, ResError>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.collections.is_empty() && self.errors.is_empty()
    }
}

/// Collection `add` event sent to clients
#[derive(Debug, Clone, Serialize)]
pub struct AddEvent {
    pub idx: usize,
    pub value: serde_json::Value,
    #[serde(flatten)]
    pub resources: Resources,
}

/// Model `change` event sent to clients
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub values: serde_json::Value,
    #[serde(flatten)]
    pub resources: Resources,
}

/// `unsubscribe` event telling the client a subscription was dropped
#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribeEvent {
    pub reason: ResError,
}

/// Result of a call, auth or new request referencing a resource
#[derive(Debug, Clone, Serialize)]
pub struct CallResourceResult {
    pub rid: String,
    #[serde(flatten)]
    pub resources: Resources,
}

#[derive(Serialize)]
struct Response<'a> {
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    result: &'a serde_json::Value,
    id: u64,
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a ResError,
    id: u64,
}

#[derive(Serialize)]
struct Event<'a> {
    event: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    data: &'a serde_json::Value,
}

fn to_text<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Serialize any result payload to a JSON value
pub fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Success reply; a `null` result omits the field
pub fn response(id: u64, result: &serde_json::Value) -> String {
    to_text(&Response { result, id })
}

/// Error reply
pub fn error_response(id: u64, error: &ResError) -> String {
    to_text(&ErrorResponse { error, id })
}

/// Event frame for `<rid>.<name>`
pub fn event(rid: &str, name: &str, data: &serde_json::Value) -> String {
    to_text(&Event {
        event: format!("{}.{}", rid, name),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_omits_null_result() {
        assert_eq!(response(3, &json!(null)), r#"{"id":3}"#);
        assert_eq!(response(1, &json!({"a":1})), r#"{"result":{"a":1},"id":1}"#);
    }

    #[test]
    fn test_error_response() {
        let frame = error_response(7, &ResError::not_found());
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["error"]["code"], "system.notFound");
    }

    #[test]
    fn test_event_frame() {
        assert_eq!(
            event("a.b", "custom", &json!(null)),
            r#"{"event":"a.b.custom"}"#
        );
        let frame = event("a.b", "remove", &json!({"idx": 2}));
        assert_eq!(frame, r#"{"event":"a.b.remove","data":{"idx":2}}"#);
    }

    #[test]
    fn test_add_event_flattens_resources() {
        let mut resources = Resources::default();
        resources.models.insert("c".into(), json!({"x": 1}));
        let data = to_value(&AddEvent {
            idx: 0,
            value: json!({"rid": "c"}),
            resources,
        });
        assert_eq!(
            data,
            json!({"idx": 0, "value": {"rid": "c"}, "models": {"c": {"x": 1}}})
        );

        let data = to_value(&ChangeEvent {
            values: json!({"a": 1}),
            resources: Resources::default(),
        });
        assert_eq!(data, json!({"values": {"a": 1}}));
    }
}
