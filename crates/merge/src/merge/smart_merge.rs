//! Deep merge of an incoming document onto a stored one.
//!
//! Objects merge key by key. Arrays of primitives are replaced by the
//! incoming array. Arrays of objects are merged item by item:
//!
//! - an item with an `id` merges into the stored item with the same `id`;
//!   an `id` ending in `-delete` removes the stored item with the bare id
//! - an item with a numeric `sequence` merges into the item with the same
//!   sequence, or is inserted so sequences stay ascending
//! - any other item is appended unless an equal item is already present

use serde_json::{Map, Value};

const DELETE_SUFFIX: &str = "-delete";

/// Merges `incoming` onto `stored`, returning the merged document.
pub fn smart_merge(stored: &Value, incoming: &Value) -> Value {
    match (stored, incoming) {
        (Value::Object(base), Value::Object(patch)) => Value::Object(merge_objects(base, patch)),
        (Value::Array(base), Value::Array(patch)) => Value::Array(merge_arrays(base, patch)),
        (_, incoming) => incoming.clone(),
    }
}

fn merge_objects(base: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut out = base.clone();
    for (key, value) in patch {
        let merged = match base.get(key) {
            Some(existing) => smart_merge(existing, value),
            None => value.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}

fn merge_arrays(base: &[Value], patch: &[Value]) -> Vec<Value> {
    let objects = patch.iter().all(Value::is_object) && !patch.is_empty();
    if !objects {
        return patch.to_vec();
    }

    let mut out = base.to_vec();
    for item in patch {
        if let Some(id) = item.get("id").and_then(Value::as_str) {
            if let Some(target) = id.strip_suffix(DELETE_SUFFIX) {
                out.retain(|existing| item_id(existing) != Some(target));
                continue;
            }
            match out.iter().position(|existing| item_id(existing) == Some(id)) {
                Some(pos) => out[pos] = smart_merge(&out[pos], item),
                None => out.push(item.clone()),
            }
            continue;
        }

        if let Some(sequence) = item.get("sequence").and_then(Value::as_f64) {
            let same = out
                .iter()
                .position(|existing| item_sequence(existing) == Some(sequence));
            match same {
                Some(pos) => out[pos] = smart_merge(&out[pos], item),
                None => {
                    let at = out
                        .iter()
                        .position(|existing| {
                            item_sequence(existing).is_some_and(|s| s > sequence)
                        })
                        .unwrap_or(out.len());
                    out.insert(at, item.clone());
                }
            }
            continue;
        }

        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn item_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

fn item_sequence(value: &Value) -> Option<f64> {
    value.get("sequence").and_then(Value::as_f64)
}
