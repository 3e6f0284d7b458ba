//! Bounded copies of JSON values for log output.

use serde_json::Value;

/// Default cap on string length in logged task events.
pub const MAX_LOG_STRING_LEN: usize = 1000;

/// Return a copy of `value` in which every string, at any nesting depth, is
/// cut to at most `max` characters. Other leaves are unchanged.
pub fn truncate_strings(value: &Value, max: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_str(s, max).to_string()),
        Value::Array(items) => Value::Array(items.iter().map(|v| truncate_strings(v, max)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_strings(v, max)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Cut `s` to at most `max` characters on a char boundary.
pub fn truncate_str(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
