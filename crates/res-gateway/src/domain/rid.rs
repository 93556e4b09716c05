//! Resource identifier helpers.
//!
//! A RID is `name[?query]` where `name` is a dot separated sequence of
//! subject tokens and `query` is an opaque suffix.

/// Placeholder expanded to the connection id in client supplied RIDs
pub const CID_PLACEHOLDER: &str = "{cid}";

/// Check that a RID is usable as a bus subject.
///
/// Tokens must be non-empty printable ASCII without `*` or `>`. A `?`
/// ends the name part and is only accepted when `allow_query` is set and
/// it does not start a token.
pub fn is_valid_rid(rid: &str, allow_query: bool) -> bool {
    let mut start = true;
    for c in rid.chars() {
        if c == '?' {
            return allow_query && !start;
        }
        if !(33..=126).contains(&(c as u32)) || c == '*' || c == '>' {
            return false;
        }
        if c == '.' {
            if start {
                return false;
            }
            start = true;
        } else {
            start = false;
        }
    }
    !start
}

/// Check a single RID token, such as a call method name.
pub fn is_valid_rid_part(part: &str) -> bool {
    !part.is_empty()
        && part.chars().all(|c| {
            (33..=126).contains(&(c as u32)) && !matches!(c, '.' | '*' | '>' | '?')
        })
}

/// Split a RID into name and query at the first `?`.
pub fn split_rid(rid: &str) -> (&str, &str) {
    match rid.split_once('?') {
        Some((name, query)) => (name, query),
        None => (rid, ""),
    }
}

/// Join a name and query back into a RID.
pub fn join_rid(name: &str, query: &str) -> String {
    if query.is_empty() {
        name.to_string()
    } else {
        format!("{}?{}", name, query)
    }
}

/// Split `rid.method` at the last dot.
///
/// Returns `None` if there is no dot or either side is empty.
pub fn split_method(s: &str) -> Option<(&str, &str)> {
    let (rid, method) = s.rsplit_once('.')?;
    if rid.is_empty() || method.is_empty() {
        return None;
    }
    Some((rid, method))
}

/// Replace every `{cid}` placeholder with the connection id.
pub fn expand_cid(rid: &str, cid: &str) -> String {
    if rid.contains(CID_PLACEHOLDER) {
        rid.replace(CID_PLACEHOLDER, cid)
    } else {
        rid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_rids() {
        assert!(is_valid_rid("test.model", false));
        assert!(is_valid_rid("a", false));
        assert!(is_valid_rid("test.collection?limit=10", true));
        assert!(is_valid_rid("test.$special", false));
    }

    #[test]
    fn test_invalid_rids() {
        assert!(!is_valid_rid("", false));
        assert!(!is_valid_rid("test..model", false));
        assert!(!is_valid_rid(".test", false));
        assert!(!is_valid_rid("test.", false));
        assert!(!is_valid_rid("test.*", false));
        assert!(!is_valid_rid("test.>", false));
        assert!(!is_valid_rid("test model", false));
        assert!(!is_valid_rid("test.model?q=1", false));
        assert!(!is_valid_rid("test.?q=1", true));
        assert!(!is_valid_rid("?q=1", true));
        assert!(!is_valid_rid("tést", false));
    }

    #[test]
    fn test_rid_part() {
        assert!(is_valid_rid_part("set"));
        assert!(!is_valid_rid_part(""));
        assert!(!is_valid_rid_part("a.b"));
        assert!(!is_valid_rid_part("a?"));
        assert!(!is_valid_rid_part("*"));
    }

    #[test]
    fn test_split_rid() {
        assert_eq!(split_rid("q?a=1&b=2"), ("q", "a=1&b=2"));
        assert_eq!(split_rid("q"), ("q", ""));
        assert_eq!(split_rid("q?a?b"), ("q", "a?b"));
        assert_eq!(join_rid("q", ""), "q");
        assert_eq!(join_rid("q", "a=1"), "q?a=1");
    }

    #[test]
    fn test_split_method() {
        assert_eq!(split_method("test.model.set"), Some(("test.model", "set")));
        assert_eq!(split_method("set"), None);
        assert_eq!(split_method("test."), None);
    }

    #[test]
    fn test_expand_cid() {
        assert_eq!(expand_cid("conn.{cid}.info", "abc"), "conn.abc.info");
        assert_eq!(expand_cid("plain", "abc"), "plain");
    }
}
