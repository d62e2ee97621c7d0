// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Maintenance marker in the node description.
//!
//! Format: `[MAINTENANCE:<record-id>] ` at the very start of the description.
//! The bare `[MAINTENANCE] ` tag written by older tooling is recognised too.
//! Only leading tags count; the text after them is the operator's own
//! description and is never touched.

const TAG_PREFIX: &str = "[MAINTENANCE";

/// Split one leading maintenance tag off `s`. Returns the tag's id (empty
/// for the legacy form) and the remainder with one following space dropped.
fn split_tag(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix(TAG_PREFIX)?;
    let close = rest.find(']')?;
    let inner = &rest[..close];
    let id = if inner.is_empty() {
        ""
    } else {
        let id = inner.strip_prefix(':')?;
        if id.is_empty() || id.contains(char::is_whitespace) {
            return None;
        }
        id
    };
    let after = &rest[close + 1..];
    Some((id, after.strip_prefix(' ').unwrap_or(after)))
}

pub fn tag(record_id: &str) -> String {
    format!("[MAINTENANCE:{}]", record_id)
}

pub fn has_marker(description: &str) -> bool {
    split_tag(description).is_some()
}

/// Record id carried by the first marker, if it has one
pub fn marker_id(description: &str) -> Option<&str> {
    split_tag(description).map(|(id, _)| id).filter(|id| !id.is_empty())
}

/// Description with the marker prepended, or `None` if one is already there
pub fn add_marker(description: &str, record_id: &str) -> Option<String> {
    if has_marker(description) {
        return None;
    }
    if description.is_empty() {
        Some(tag(record_id))
    } else {
        Some(format!("{} {}", tag(record_id), description))
    }
}

/// Description with every leading marker removed
pub fn strip_marker(description: &str) -> &str {
    let mut rest = description;
    while let Some((_, after)) = split_tag(rest) {
        rest = after;
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_strip() {
        let marked = add_marker("rack 4, PDU B", "abc").unwrap();
        assert_eq!(marked, "[MAINTENANCE:abc] rack 4, PDU B");
        assert!(has_marker(&marked));
        assert_eq!(marker_id(&marked), Some("abc"));
        assert_eq!(strip_marker(&marked), "rack 4, PDU B");
    }

    #[test]
    fn test_add_is_noop_when_marked() {
        assert_eq!(add_marker("[MAINTENANCE:abc] x", "def"), None);
        assert_eq!(add_marker("[MAINTENANCE] x", "def"), None);
    }

    #[test]
    fn test_empty_description() {
        let marked = add_marker("", "abc").unwrap();
        assert_eq!(marked, "[MAINTENANCE:abc]");
        assert_eq!(strip_marker(&marked), "");
    }

    #[test]
    fn test_legacy_tag() {
        assert!(has_marker("[MAINTENANCE] old"));
        assert_eq!(marker_id("[MAINTENANCE] old"), None);
        assert_eq!(strip_marker("[MAINTENANCE] old"), "old");
    }

    #[test]
    fn test_doubled_tags_strip_in_one_pass() {
        assert_eq!(strip_marker("[MAINTENANCE:a] [MAINTENANCE] [MAINTENANCE:b] host"), "host");
    }

    #[test]
    fn test_only_leading_tags_count() {
        let desc = "see [MAINTENANCE:abc] in the runbook";
        assert!(!has_marker(desc));
        assert_eq!(strip_marker(desc), desc);
    }

    #[test]
    fn test_lookalikes_are_not_markers() {
        assert!(!has_marker("[MAINTENANCEX] host"));
        assert!(!has_marker("[MAINTENANCE:] host"));
        assert!(!has_marker("[MAINTENANCE:a b] host"));
        assert!(!has_marker("[MAINTENANCE unterminated"));
    }
}
