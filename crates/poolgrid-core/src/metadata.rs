//! Open, JSON-serializable metadata bags.
//!
//! Tracking calls accept arbitrary caller metadata. It is cleaned once when
//! it enters a ledger so nothing on the acquire/release path has to look at
//! it again.

use serde_json::Value;

/// String-keyed map of JSON values.
pub type Metadata = serde_json::Map<String, Value>;

/// Maximum keys kept per bag.
pub const MAX_KEYS: usize = 64;

/// Maximum length (in chars) of a string value.
pub const MAX_STRING_CHARS: usize = 1024;

/// Drop blank keys, cap the key count, and truncate long strings.
pub fn sanitize(metadata: Metadata) -> Metadata {
    metadata
        .into_iter()
        .filter(|(key, _)| !key.trim().is_empty())
        .take(MAX_KEYS)
        .map(|(key, value)| (key, truncate_value(value)))
        .collect()
}

fn truncate_value(value: Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > MAX_STRING_CHARS => {
            Value::String(s.chars().take(MAX_STRING_CHARS).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn keeps_regular_entries() {
        let cleaned = sanitize(bag(json!({"tenant": "acme", "attempt": 2})));
        assert_eq!(cleaned.get("tenant"), Some(&json!("acme")));
        assert_eq!(cleaned.get("attempt"), Some(&json!(2)));
    }

    #[test]
    fn drops_blank_keys() {
        let cleaned = sanitize(bag(json!({"": 1, "  ": 2, "ok": 3})));
        assert_eq!(cleaned.len(), 1);
        assert!(cleaned.contains_key("ok"));
    }

    #[test]
    fn truncates_long_strings() {
        let long = "x".repeat(MAX_STRING_CHARS + 10);
        let cleaned = sanitize(bag(json!({ "sql": long })));
        let kept = cleaned["sql"].as_str().unwrap();
        assert_eq!(kept.chars().count(), MAX_STRING_CHARS);
    }

    #[test]
    fn caps_key_count() {
        let mut map = Metadata::new();
        for i in 0..(MAX_KEYS + 5) {
            map.insert(format!("k{i}"), json!(i));
        }
        assert_eq!(sanitize(map).len(), MAX_KEYS);
    }
}
