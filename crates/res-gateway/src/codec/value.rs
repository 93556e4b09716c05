//! RES values held in models and collections.
//!
//! | JSON                          | Value              |
//! |-------------------------------|--------------------|
//! | string, number, bool, null    | `Primitive`        |
//! | `{"rid":"a.b"}`               | `Reference`        |
//! | `{"rid":"a.b","soft":true}`   | `SoftReference`    |
//! | `{"data":{..}}`/`{"data":[..]}` | `Data`           |
//! | `{"data":1}`                  | `Primitive`        |
//! | `{"action":"delete"}`         | `Delete`           |
//!
//! Any other object or a bare array is rejected.

use crate::domain::error::{ResError, ResResult};
use crate::domain::rid::is_valid_rid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map};
use std::collections::BTreeMap;

/// Model properties keyed by name
pub type Model = BTreeMap<String, Value>;

/// Ordered collection values
pub type Collection = Vec<Value>;

/// A single RES value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON primitive
    Primitive(serde_json::Value),
    /// Reference to another resource
    Reference(String),
    /// Reference that is not followed
    SoftReference(String),
    /// Wrapped JSON object or array
    Data(serde_json::Value),
    /// Property removal in change events
    Delete,
}

impl Value {
    /// Parse a value from its JSON form.
    pub fn from_json(json: serde_json::Value) -> ResResult<Self> {
        match json {
            serde_json::Value::Object(obj) => Self::from_object(obj),
            serde_json::Value::Array(_) => Err(ResError::internal(
                "invalid value: nested json array must be wrapped as a data value",
            )),
            primitive => Ok(Value::Primitive(primitive)),
        }
    }

    fn from_object(mut obj: Map<String, serde_json::Value>) -> ResResult<Self> {
        let action = obj.remove("action");
        let data = obj.remove("data");

        if let Some(rid) = obj.remove("rid") {
            let rid = match rid {
                serde_json::Value::String(rid) if !rid.is_empty() => rid,
                _ => {
                    return Err(ResError::internal(
                        "invalid value: resource references requires a non-empty \"rid\" value",
                    ))
                }
            };
            if action.is_some() || data.is_some() {
                return Err(ResError::internal("invalid value: ambiguous value type"));
            }
            if !is_valid_rid(&rid, true) {
                return Err(ResError::internal(format!(
                    "invalid value: resource reference rid \"{}\" is invalid",
                    rid
                )));
            }
            let soft = matches!(obj.get("soft"), Some(serde_json::Value::Bool(true)));
            return Ok(if soft {
                Value::SoftReference(rid)
            } else {
                Value::Reference(rid)
            });
        }

        if let Some(action) = action {
            if data.is_some() {
                return Err(ResError::internal("invalid value: ambiguous value type"));
            }
            return match action.as_str() {
                Some("delete") => Ok(Value::Delete),
                _ => Err(ResError::internal(format!(
                    "invalid value: unknown action {}",
                    action
                ))),
            };
        }

        match data {
            Some(inner @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
                Ok(Value::Data(inner))
            }
            Some(primitive) => Ok(Value::Primitive(primitive)),
            None => Err(ResError::internal(
                "invalid value: nested json object must be wrapped as a data value",
            )),
        }
    }

    /// JSON form of the value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Primitive(v) => v.clone(),
            Value::Reference(rid) => json!({ "rid": rid }),
            Value::SoftReference(rid) => json!({ "rid": rid, "soft": true }),
            Value::Data(v) => json!({ "data": v }),
            Value::Delete => json!({ "action": "delete" }),
        }
    }

    /// JSON form understood by clients below protocol 1.2.1.
    ///
    /// Soft references become plain RID strings and data values a
    /// placeholder.
    pub fn to_legacy_json(&self) -> serde_json::Value {
        match self {
            Value::SoftReference(rid) => serde_json::Value::String(rid.clone()),
            Value::Data(_) => serde_json::Value::String("[Data]".to_string()),
            other => other.to_json(),
        }
    }

    /// True for anything but `Delete`
    pub fn is_proper(&self) -> bool {
        !matches!(self, Value::Delete)
    }

    /// RID of a strong reference
    pub fn reference(&self) -> Option<&str> {
        match self {
            Value::Reference(rid) => Some(rid),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(json).map_err(|e| serde::de::Error::custom(e.message))
    }
}
