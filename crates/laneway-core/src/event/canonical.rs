//! Canonical JSON serialization.
//!
//! Compact JSON with object keys sorted lexicographically at every nesting
//! level, so the same event always produces the same bytes on disk and the
//! log can be hashed or diffed reproducibly.

use serde_json::Value;

/// Produce a canonical JSON string from a [`serde_json::Value`].
///
/// ```
/// use serde_json::json;
/// use laneway_core::event::canonical::canonicalize_json;
///
/// let val = json!({"wp_id": "WP01", "at": "2026-01-01T00:00:00Z", "evidence": {"verdict": "approved", "reviewer": "bo"}});
/// assert_eq!(
///     canonicalize_json(&val),
///     r#"{"at":"2026-01-01T00:00:00Z","evidence":{"reviewer":"bo","verdict":"approved"},"wp_id":"WP01"}"#
/// );
/// ```
#[must_use]
pub fn canonicalize_json(value: &Value) -> String {
    let mut buf = String::new();
    write_canonical(value, &mut buf);
    buf
}

fn write_canonical(value: &Value, buf: &mut String) {
    match value {
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(item, buf);
            }
            buf.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            buf.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                buf.push_str(&Value::from(key.as_str()).to_string());
                buf.push(':');
                if let Some(val) = map.get(*key) {
                    write_canonical(val, buf);
                }
            }
            buf.push('}');
        }
        // Scalars: serde_json's Display is already compact and escaped.
        scalar => buf.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_are_compact() {
        assert_eq!(canonicalize_json(&json!(null)), "null");
        assert_eq!(canonicalize_json(&json!(false)), "false");
        assert_eq!(canonicalize_json(&json!(7)), "7");
        assert_eq!(canonicalize_json(&json!("in \"quotes\"")), r#""in \"quotes\"""#);
    }

    #[test]
    fn nested_keys_sorted_arrays_kept() {
        let val = json!({
            "to_lane": "claimed",
            "evidence": {"verdict": "approved", "checks": ["b", "a"]},
            "actor": "agent-1"
        });
        assert_eq!(
            canonicalize_json(&val),
            r#"{"actor":"agent-1","evidence":{"checks":["b","a"],"verdict":"approved"},"to_lane":"claimed"}"#
        );
    }

    #[test]
    fn output_never_contains_newline() {
        let val = json!({"reason": "line one\nline two"});
        let out = canonicalize_json(&val);
        assert!(!out.contains('\n'));
        assert!(out.contains("\\n"));
    }
}
