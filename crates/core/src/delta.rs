//! Structural JSON diff envelopes (`lapc-delta-v1`).
//!
//! A delta is an ordered list of `set`/`delete` operations over canonical
//! paths. Arrays that change length are replaced wholesale; everything
//! else diffs recursively. `apply_delta` inverts `create_delta` exactly.

use crate::json::{canonicalize, json_size, stable_hash};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Wire identifier carried by every delta envelope.
pub const DELTA_ENCODING: &str = "lapc-delta-v1";

/// Gates applied before a delta envelope is produced.
#[derive(Debug, Clone, Copy)]
pub struct DeltaOptions {
    /// Minimum `(full - patch) / full` ratio for the delta to be worth it.
    pub min_savings_ratio: f64,
    /// Hard ceiling on the serialized ops size.
    pub max_patch_bytes: usize,
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self {
            min_savings_ratio: 0.15,
            max_patch_bytes: 65_536,
        }
    }
}

/// Errors raised when applying a delta envelope.
#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("unsupported delta envelope")]
    UnsupportedEnvelope,
    #[error("delta envelope missing ops")]
    MissingOps,
    #[error("invalid delta op: {0}")]
    InvalidOp(String),
    #[error("invalid delta path: {0}")]
    InvalidPath(String),
}

fn diff_values(previous: &Value, current: &Value, path: &mut Vec<Value>, ops: &mut Vec<Value>) {
    if previous == current {
        return;
    }

    match (previous, current) {
        (Value::Array(prev_items), Value::Array(cur_items)) => {
            if prev_items.len() != cur_items.len() {
                ops.push(json!({"op": "set", "path": path.clone(), "value": current.clone()}));
                return;
            }
            for (idx, (prev_item, cur_item)) in prev_items.iter().zip(cur_items).enumerate() {
                path.push(json!(idx));
                diff_values(prev_item, cur_item, path, ops);
                path.pop();
            }
        }
        (Value::Object(prev_map), Value::Object(cur_map)) => {
            let mut keys: Vec<&String> = prev_map.keys().chain(cur_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                path.push(json!(key));
                match (prev_map.get(key.as_str()), cur_map.get(key.as_str())) {
                    (Some(_), None) => ops.push(json!({"op": "delete", "path": path.clone()})),
                    (None, Some(value)) => {
                        ops.push(json!({"op": "set", "path": path.clone(), "value": value.clone()}));
                    }
                    (Some(prev_value), Some(cur_value)) => {
                        diff_values(prev_value, cur_value, path, ops);
                    }
                    (None, None) => {}
                }
                path.pop();
            }
        }
        _ => ops.push(json!({"op": "set", "path": path.clone(), "value": current.clone()})),
    }
}

/// Builds a delta envelope from `previous` to `current`, or `None` when
/// the payloads are equal or the patch fails the size/savings gates.
pub fn create_delta(previous: &Value, current: &Value, opts: &DeltaOptions) -> Option<Value> {
    let canonical_previous = canonicalize(previous);
    let canonical_current = canonicalize(current);
    if canonical_previous == canonical_current {
        return None;
    }

    let mut ops = Vec::new();
    diff_values(&canonical_previous, &canonical_current, &mut Vec::new(), &mut ops);
    if ops.is_empty() {
        return None;
    }

    let ops_value = Value::Array(ops);
    let patch_bytes = json_size(&ops_value);
    let full_bytes = json_size(&canonical_current);
    if patch_bytes > opts.max_patch_bytes {
        return None;
    }

    let savings_ratio = if full_bytes > 0 {
        (full_bytes as f64 - patch_bytes as f64) / full_bytes as f64
    } else {
        0.0
    };
    if savings_ratio < opts.min_savings_ratio {
        return None;
    }

    Some(json!({
        "encoding": DELTA_ENCODING,
        "baselineHash": stable_hash(&canonical_previous),
        "currentHash": stable_hash(&canonical_current),
        "ops": ops_value,
        "patchBytes": patch_bytes,
        "fullBytes": full_bytes,
        "savedBytes": full_bytes.saturating_sub(patch_bytes),
        "savedRatio": savings_ratio,
    }))
}

enum PathSegment<'a> {
    Index(usize),
    Key(&'a str),
}

fn segment(value: &Value) -> Result<PathSegment<'_>, DeltaError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(|i| PathSegment::Index(i as usize))
            .ok_or_else(|| DeltaError::InvalidPath("negative array index".into())),
        Value::String(s) => Ok(PathSegment::Key(s)),
        other => Err(DeltaError::InvalidPath(format!("bad segment {other}"))),
    }
}

/// Navigates to the parent container of the final path segment, growing
/// intermediate containers as needed.
fn parent_for_path<'a>(root: &'a mut Value, path: &[Value]) -> Result<&'a mut Value, DeltaError> {
    let mut cursor = root;
    for window in path.windows(2) {
        let next_is_index = matches!(window[1], Value::Number(_));
        match segment(&window[0])? {
            PathSegment::Index(idx) => {
                let Value::Array(items) = cursor else {
                    return Err(DeltaError::InvalidPath("expected array parent".into()));
                };
                while items.len() <= idx {
                    items.push(Value::Null);
                }
                if items[idx].is_null() {
                    items[idx] = if next_is_index { json!([]) } else { json!({}) };
                }
                cursor = &mut items[idx];
            }
            PathSegment::Key(key) => {
                let Value::Object(map) = cursor else {
                    return Err(DeltaError::InvalidPath("expected object parent".into()));
                };
                let entry = map.entry(key.to_string()).or_insert(Value::Null);
                if entry.is_null() {
                    *entry = if next_is_index { json!([]) } else { json!({}) };
                }
                cursor = entry;
            }
        }
    }
    Ok(cursor)
}

fn apply_set(output: &mut Value, path: &[Value], value: Value) -> Result<(), DeltaError> {
    if path.is_empty() {
        *output = value;
        return Ok(());
    }
    let parent = parent_for_path(output, path)?;
    match (segment(&path[path.len() - 1])?, parent) {
        (PathSegment::Index(idx), Value::Array(items)) => {
            while items.len() <= idx {
                items.push(Value::Null);
            }
            items[idx] = value;
        }
        (PathSegment::Key(key), Value::Object(map)) => {
            map.insert(key.to_string(), value);
        }
        _ => return Err(DeltaError::InvalidPath("set target mismatch".into())),
    }
    Ok(())
}

fn apply_delete(output: &mut Value, path: &[Value]) -> Result<(), DeltaError> {
    if path.is_empty() {
        *output = Value::Null;
        return Ok(());
    }
    let parent = parent_for_path(output, path)?;
    match (segment(&path[path.len() - 1])?, parent) {
        (PathSegment::Index(idx), Value::Array(items)) => {
            if idx < items.len() {
                items.remove(idx);
            }
        }
        (PathSegment::Key(key), Value::Object(map)) => {
            map.remove(key);
        }
        _ => {}
    }
    Ok(())
}

/// Reconstructs the current payload from `previous` plus a delta envelope.
pub fn apply_delta(previous: &Value, delta: &Value) -> Result<Value, DeltaError> {
    let envelope: &Map<String, Value> = delta.as_object().ok_or(DeltaError::UnsupportedEnvelope)?;
    if envelope.get("encoding").and_then(Value::as_str) != Some(DELTA_ENCODING) {
        return Err(DeltaError::UnsupportedEnvelope);
    }
    let ops = envelope
        .get("ops")
        .and_then(Value::as_array)
        .ok_or(DeltaError::MissingOps)?;

    let mut output = previous.clone();
    for op in ops {
        let op_map = op
            .as_object()
            .ok_or_else(|| DeltaError::InvalidOp("op is not an object".into()))?;
        let path = op_map
            .get("path")
            .and_then(Value::as_array)
            .ok_or_else(|| DeltaError::InvalidOp("op missing path".into()))?;
        match op_map.get("op").and_then(Value::as_str) {
            Some("set") => {
                apply_set(&mut output, path, op_map.get("value").cloned().unwrap_or(Value::Null))?;
            }
            Some("delete") => apply_delete(&mut output, path)?,
            other => return Err(DeltaError::InvalidOp(format!("{other:?}"))),
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Negative threshold keeps ops-level tests independent of whether the
    // patch happens to be smaller than the full payload.
    const NO_THRESHOLD: DeltaOptions = DeltaOptions {
        min_savings_ratio: -999.0,
        max_patch_bytes: 65_536,
    };

    #[test]
    fn no_delta_when_payloads_are_equal() {
        let payload = json!({"items": [{"id": 1, "status": "open"}]});
        assert!(create_delta(&payload, &payload, &NO_THRESHOLD).is_none());
    }

    #[test]
    fn roundtrip_reconstructs_current() {
        let previous = json!({
            "items": [
                {"id": 1, "status": "open", "title": "alpha"},
                {"id": 2, "status": "open", "title": "beta"},
            ],
            "count": 2,
        });
        let current = json!({
            "items": [
                {"id": 1, "status": "closed", "title": "alpha"},
                {"id": 2, "status": "open", "title": "beta"},
            ],
            "count": 2,
        });
        let delta = create_delta(&previous, &current, &NO_THRESHOLD).expect("delta");
        assert_eq!(delta["encoding"], DELTA_ENCODING);
        assert!(!delta["ops"].as_array().unwrap().is_empty());
        let reconstructed = apply_delta(&previous, &delta).expect("apply");
        assert_eq!(canonicalize(&reconstructed), canonicalize(&current));
    }

    #[test]
    fn ops_use_set_and_delete_with_path_arrays() {
        let previous = json!({"a": 1, "b": 2, "c": 3});
        let current = json!({"a": 1, "b": 99});
        let delta = create_delta(&previous, &current, &NO_THRESHOLD).expect("delta");
        for op in delta["ops"].as_array().unwrap() {
            assert!(matches!(op["op"].as_str(), Some("set") | Some("delete")));
            assert!(op["path"].is_array());
        }
    }

    #[test]
    fn deleted_and_added_keys_roundtrip() {
        let cases = [
            (json!({"x": 1, "y": 2, "z": 3}), json!({"x": 1, "z": 3})),
            (json!({"x": 1}), json!({"x": 1, "y": 2})),
            (json!({"a": {"b": {"c": 1}}}), json!({"a": {"b": {"c": 2}}})),
            (json!({"items": [1, 2, 3]}), json!({"items": [1, 99, 3]})),
            (json!({"items": [1, 2]}), json!({"items": [1, 2, 3]})),
        ];
        for (previous, current) in cases {
            let delta = create_delta(&previous, &current, &NO_THRESHOLD).expect("delta");
            let reconstructed = apply_delta(&previous, &delta).expect("apply");
            assert_eq!(canonicalize(&reconstructed), canonicalize(&current));
        }
    }

    #[test]
    fn high_savings_threshold_rejects_small_deltas() {
        let delta = create_delta(
            &json!({"a": 1}),
            &json!({"a": 2}),
            &DeltaOptions {
                min_savings_ratio: 0.99,
                max_patch_bytes: 65_536,
            },
        );
        assert!(delta.is_none());
    }

    #[test]
    fn envelope_hashes_match_stable_hash() {
        let previous = json!({"foo": "bar"});
        let current = json!({"foo": "baz"});
        let delta = create_delta(&previous, &current, &NO_THRESHOLD).expect("delta");
        assert_eq!(delta["baselineHash"], json!(stable_hash(&previous)));
        assert_eq!(delta["currentHash"], json!(stable_hash(&current)));
    }

    #[test]
    fn byte_accounting_is_consistent() {
        let previous = json!({"data": "x".repeat(100)});
        let current = json!({"data": "y".repeat(100)});
        let delta = create_delta(&previous, &current, &NO_THRESHOLD).expect("delta");
        let full = delta["fullBytes"].as_u64().unwrap();
        let patch = delta["patchBytes"].as_u64().unwrap();
        assert_eq!(delta["savedBytes"].as_u64().unwrap(), full.saturating_sub(patch));
    }

    #[test]
    fn apply_rejects_bad_envelopes() {
        assert!(matches!(
            apply_delta(&json!({}), &json!({"encoding": "unknown"})),
            Err(DeltaError::UnsupportedEnvelope)
        ));
        assert!(matches!(
            apply_delta(&json!({}), &json!({"encoding": DELTA_ENCODING})),
            Err(DeltaError::MissingOps)
        ));
    }

    #[test]
    fn realistic_payload_produces_actual_savings() {
        let items = |tweak: bool| {
            (0..50)
                .map(|i| {
                    let value = if tweak && i == 25 { 999 } else { i * 10 };
                    json!({"id": i, "name": format!("item_{i}"), "value": value})
                })
                .collect::<Vec<_>>()
        };
        let previous = json!({"results": items(false), "total": 50, "page": 1});
        let current = json!({"results": items(true), "total": 50, "page": 1});
        let delta = create_delta(
            &previous,
            &current,
            &DeltaOptions {
                min_savings_ratio: 0.0,
                max_patch_bytes: 65_536,
            },
        )
        .expect("delta");
        assert!(delta["savedBytes"].as_u64().unwrap() > 0);
        assert!(delta["savedRatio"].as_f64().unwrap() > 0.0);
        let reconstructed = apply_delta(&previous, &delta).expect("apply");
        assert_eq!(canonicalize(&reconstructed), canonicalize(&current));
    }
}
