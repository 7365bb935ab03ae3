//! Dotted-path access into JSON values (`"aggregate.id"`, `"items.0.sku"`).

use serde_json::{Map, Value};

/// Converts a dotted path into a JSON pointer (RFC 6901).
pub fn to_pointer(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    path.split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

/// Returns the value at `path`, or `None` if any segment is missing.
///
/// An empty path addresses the value itself.
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    value.pointer(&to_pointer(path))
}

/// Returns true if a value (including `null`) is present at `path`.
pub fn exists(value: &Value, path: &str) -> bool {
    get(value, path).is_some()
}

/// Writes `new_value` at `path`, creating intermediate objects as needed.
///
/// Non-object intermediates are replaced by objects. An empty path replaces
/// the whole value.
pub fn put(value: &mut Value, path: &str, new_value: Value) {
    if let Some(slot) = value.pointer_mut(&to_pointer(path)) {
        *slot = new_value;
        return;
    }
    let segments: Vec<&str> = path.split('.').collect();
    put_segments(value, &segments, new_value);
}

fn put_segments(value: &mut Value, segments: &[&str], new_value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *value = new_value;
        return;
    };
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    if let Value::Object(map) = value {
        let slot = map.entry(first.to_string()).or_insert(Value::Null);
        put_segments(slot, rest, new_value);
    }
}

/// Renders a scalar as a string: strings verbatim, numbers and booleans via
/// their JSON form. Objects, arrays and `null` yield `None`.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
