//! JSON rendering of resources for the HTTP API.
//!
//! A resource is rendered with its references resolved in place:
//!
//! ```text
//! { "title": "Book", "author": { "href": "/api/library/authors/1",
//!                                "model": { "name": "Jane" } } }
//! ```
//!
//! A reference back into the path being rendered only gets its `href`.

use super::path::rid_to_path;
use crate::codec::Value;
use crate::conn::Conn;
use crate::domain::error::ResError;
use crate::rescache::Snapshot;
use serde_json::{json, Map};

/// Renders a loaded subscription tree of a connection
pub struct ApiEncoder<'a> {
    conn: &'a Conn,
    api_path: &'a str,
    path: Vec<String>,
}

impl<'a> ApiEncoder<'a> {
    pub fn new(conn: &'a Conn, api_path: &'a str) -> Self {
        Self {
            conn,
            api_path,
            path: Vec::new(),
        }
    }

    /// Render the resource `rid` held by the connection
    pub fn encode(mut self, rid: &str) -> serde_json::Value {
        self.encode_resource(rid, false)
    }

    fn encode_resource(&mut self, rid: &str, wrap: bool) -> serde_json::Value {
        let href = rid_to_path(rid, self.api_path);
        if self.path.iter().any(|r| r == rid) {
            return json!({ "href": href });
        }

        let sub = self.conn.subscription(rid);
        let err = match sub {
            None => Some(ResError::not_found()),
            Some(sub) => sub.error(),
        };
        if let Some(err) = err {
            let err = to_json(&err);
            return if wrap {
                json!({ "href": href, "error": err })
            } else {
                err
            };
        }

        let Some(data) = sub.and_then(|s| s.data()).cloned() else {
            return serde_json::Value::Null;
        };

        self.path.push(rid.to_string());
        let (key, body) = match data {
            Snapshot::Model(model) => {
                let mut obj = Map::new();
                for (k, v) in model.iter() {
                    obj.insert(k.clone(), self.encode_value(v));
                }
                ("model", serde_json::Value::Object(obj))
            }
            Snapshot::Collection(collection) => {
                let arr = collection.iter().map(|v| self.encode_value(v)).collect();
                ("collection", serde_json::Value::Array(arr))
            }
        };
        self.path.pop();

        if wrap {
            let mut obj = Map::new();
            obj.insert("href".to_string(), json!(href));
            obj.insert(key.to_string(), body);
            serde_json::Value::Object(obj)
        } else {
            body
        }
    }

    fn encode_value(&mut self, v: &Value) -> serde_json::Value {
        match v {
            Value::Reference(rid) => self.encode_resource(rid, true),
            Value::SoftReference(rid) => json!({ "href": rid_to_path(rid, self.api_path) }),
            Value::Data(data) => data.clone(),
            Value::Primitive(p) => p.clone(),
            Value::Delete => serde_json::Value::Null,
        }
    }
}

/// JSON form of an error
pub fn to_json(err: &ResError) -> serde_json::Value {
    serde_json::to_value(err).unwrap_or_else(|_| json!({ "code": err.code, "message": err.message }))
}
