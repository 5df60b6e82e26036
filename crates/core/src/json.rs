//! Canonical JSON helpers shared by the hashing, diffing, and caching layers.
//!
//! Pass-through messages keep their original key order (the proxy must not
//! reorder what it merely relays), so canonicalization is a separate,
//! explicit step: object keys are sorted recursively, arrays keep their
//! order. Every hash in the workspace is computed over the compact
//! serialization of a canonicalized value.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Returns a copy of `value` with all object keys recursively sorted.
///
/// Arrays are left in order; scalars are returned as-is.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact canonical serialization: the preimage of every stable hash.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

/// Hex-encoded SHA-256 over the canonical serialization of `value`.
pub fn stable_hash(value: &Value) -> String {
    let text = canonical_json(value);
    let digest = Sha256::digest(text.as_bytes());
    hex_encode(&digest)
}

/// Byte length of the compact serialization of `value`.
///
/// Used for savings accounting and size gates throughout the pipeline.
pub fn json_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

/// Structural equality under canonicalization (key order ignored).
pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    canonicalize(a) == canonicalize(b)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
