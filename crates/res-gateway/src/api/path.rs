//! Conversion between URL paths and resource IDs.
//!
//! `/api/library/books/42?x=1` maps to `library.books.42?x=1` with prefix
//! `/api/`. Path segments are percent-decoded; a literal `.` in a path is
//! never accepted since it would split a segment.

/// Resource ID for a raw URL path.
///
/// Returns `None` if the path is the prefix itself, lies outside it,
/// contains a dot or has an invalid escape.
pub fn path_to_rid(path: &str, query: &str, prefix: &str) -> Option<String> {
    let parts = path_parts(path, prefix)?;
    Some(with_query(parts.join("."), query))
}

/// Resource ID and action for a raw URL path.
///
/// The last segment is the action, so at least two segments are needed.
pub fn path_to_rid_action(path: &str, query: &str, prefix: &str) -> Option<(String, String)> {
    let mut parts = path_parts(path, prefix)?;
    if parts.len() < 2 {
        return None;
    }
    let action = parts.pop()?;
    Some((with_query(parts.join("."), query), action))
}

/// URL path for a resource ID
pub fn rid_to_path(rid: &str, prefix: &str) -> String {
    if rid.is_empty() {
        return String::new();
    }
    format!("{}{}", prefix, escape_segment(rid).replace('.', "/"))
}

fn path_parts(path: &str, prefix: &str) -> Option<Vec<String>> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.contains('.') {
        return None;
    }
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    rest.split('/').map(unescape).collect()
}

fn with_query(rid: String, query: &str) -> String {
    if query.is_empty() {
        rid
    } else {
        format!("{}?{}", rid, query)
    }
}

fn escape_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        let keep = b.is_ascii_alphanumeric()
            || matches!(b, b'-' | b'_' | b'.' | b'~' | b'$' | b'&' | b'+' | b':' | b'=' | b'@');
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn unescape(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
