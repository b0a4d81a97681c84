//! Context path helpers.
//!
//! Paths address values inside the run context: `$` is the whole context,
//! `$.a.b` walks object keys, and numeric segments index into arrays on read.
//! A path without the `$` root is read as if it had one (`a.b` == `$.a.b`).

use serde_json::{Map, Value};

/// Whether a mapping value should be read from the context rather than used literally.
pub fn is_path(s: &str) -> bool {
    s == "$" || s.starts_with("$.")
}

fn segments(path: &str) -> Vec<&str> {
    let trimmed = path.trim();
    let rest = if trimmed == "$" {
        ""
    } else if let Some(rest) = trimmed.strip_prefix("$.") {
        rest
    } else {
        trimmed
    };
    rest.split('.').filter(|s| !s.is_empty()).collect()
}

/// Read the value at `path`, or `None` when any segment is missing.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments(path) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at `path`, creating intermediate objects as needed.
///
/// Non-object values found along the way are replaced by objects. Writing to
/// `$` replaces the whole root.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let segs = segments(path);
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for segment in parents {
        current = ensure_object(current)
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(current).insert(last.to_string(), value);
}

/// Insert `value` under the literal top-level `key` (no path parsing).
pub fn set_key(root: &mut Value, key: &str, value: Value) {
    ensure_object(root).insert(key.to_string(), value);
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}
