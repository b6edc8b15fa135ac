//! Response sanitation for stored and logged snapshots

use serde_json::{Map, Value};

const REDACTED: &str = "[REDACTED]";
const TRUNCATED: &str = "...[TRUNCATED]";
const MAX_STRING_CHARS: usize = 500;
const MAX_LIST_ITEMS: usize = 10;
const SECRET_KEYS: [&str; 4] = ["authorization", "token", "secret", "key"];

/// Copy `value` with secrets redacted and large fields cut down.
///
/// - object keys named `authorization`, `token`, `secret` or `key` (any case)
///   are replaced with `[REDACTED]`
/// - strings over 500 characters keep their first 500 plus a marker
/// - arrays over 10 items keep their first 10 plus a marker element
/// - nested objects are sanitized recursively
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_map(map)),
        other => sanitize_leaf(other),
    }
}

fn sanitize_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            let lowered = key.to_ascii_lowercase();
            let cleaned = if SECRET_KEYS.contains(&lowered.as_str()) {
                Value::String(REDACTED.into())
            } else {
                sanitize(value)
            };
            (key.clone(), cleaned)
        })
        .collect()
}

fn sanitize_leaf(value: &Value) -> Value {
    match value {
        Value::String(s) => match s.char_indices().nth(MAX_STRING_CHARS) {
            Some((idx, _)) => Value::String(format!("{}{TRUNCATED}", &s[..idx])),
            None => value.clone(),
        },
        Value::Array(items) if items.len() > MAX_LIST_ITEMS => {
            let mut kept: Vec<Value> = items[..MAX_LIST_ITEMS].iter().map(sanitize).collect();
            kept.push(Value::String(TRUNCATED.into()));
            Value::Array(kept)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}
