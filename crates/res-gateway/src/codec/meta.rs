//! Response meta objects.
//!
//! Services may attach a `meta` object to access, call and auth responses
//! of HTTP-flagged requests. It can override the HTTP status of the reply
//! and add response headers.

use super::payloads::HeaderMap;
use serde::Deserialize;

/// Header whose values are appended rather than replaced
pub const SET_COOKIE: &str = "Set-Cookie";

/// Meta object of a service response
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub header: HeaderMap,
}

#[derive(Deserialize)]
struct RawMeta {
    meta: Option<Meta>,
}

impl Meta {
    /// Combine two optional metas. Status and headers in `other` win, except
    /// `Set-Cookie` values which accumulate.
    pub fn merge(base: Option<Meta>, other: Option<Meta>) -> Option<Meta> {
        let (mut base, other) = match (base, other) {
            (None, other) => return other,
            (base, None) => return base,
            (Some(base), Some(other)) => (base, other),
        };
        if other.status.is_some() {
            base.status = other.status;
        }
        merge_header(&mut base.header, other.header);
        Some(base)
    }

    /// Whether the status must be replied directly, skipping any further
    /// requests (3XX, 4XX and 5XX)
    pub fn is_direct_response_status(&self) -> bool {
        self.status.is_some_and(|s| (300..600).contains(&s))
    }

    /// Whether the status, if set, is one a service may return
    pub fn is_valid_status(&self) -> bool {
        self.status.map_or(true, |s| (300..600).contains(&s))
    }

    fn canonicalize(&mut self) {
        let header = std::mem::take(&mut self.header);
        for (key, values) in header {
            self.header
                .entry(canonical_header_key(&key))
                .or_default()
                .extend(values);
        }
    }
}

/// Merge headers from `other` into `into`, replacing values except for
/// `Set-Cookie`.
pub fn merge_header(into: &mut HeaderMap, other: HeaderMap) {
    for (key, values) in other {
        if key == SET_COOKIE {
            into.entry(key).or_default().extend(values);
        } else {
            into.insert(key, values);
        }
    }
}

/// Decode the meta object of a response, if any.
///
/// Malformed meta objects are treated as missing.
pub fn decode_response_meta(payload: &[u8]) -> Option<Meta> {
    let mut meta = serde_json::from_slice::<RawMeta>(payload).ok()?.meta?;
    meta.canonicalize();
    Some(meta)
}

/// Canonical MIME header key: the first letter and any letter following a
/// hyphen in upper case, the rest in lower case. Keys with characters
/// outside of a token are returned unchanged.
pub fn canonical_header_key(key: &str) -> String {
    let is_token = |b: u8| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b);
    if key.is_empty() || !key.bytes().all(is_token) {
        return key.to_string();
    }
    let mut upper = true;
    key.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}
