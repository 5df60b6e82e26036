//! Reversible compression for structured JSON results (`lapc-json-v1`).
//!
//! Two transforms, both invertible from the envelope alone (plus an
//! optional shared key dictionary): frequent long object keys are renamed
//! to short aliases, and homogeneous arrays of objects are packed into a
//! columnar `{"~t": {"c": …, "r": …}}` form.

use crate::json::{canonical_json, json_size};
use crate::tokens::TokenCounter;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Wire identifier carried by every result-compression envelope.
pub const RESULT_ENCODING: &str = "lapc-json-v1";

/// How aggressively keys are aliased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// No key aliasing (compression is forced off at the config layer).
    Off,
    /// Alias keys appearing at least twice.
    #[default]
    Balanced,
    /// Alias every eligible key.
    Aggressive,
}

impl CompressionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(format!("invalid result compression mode: {other}")),
        }
    }
}

/// Knobs for one compression pass.
#[derive(Debug, Clone)]
pub struct CompressionOptions {
    pub mode: CompressionMode,
    pub strip_nulls: bool,
    pub strip_defaults: bool,
    pub min_payload_bytes: usize,
    pub enable_columnar: bool,
    pub columnar_min_rows: usize,
    pub columnar_min_fields: usize,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            mode: CompressionMode::Balanced,
            strip_nulls: false,
            strip_defaults: false,
            min_payload_bytes: 512,
            enable_columnar: true,
            columnar_min_rows: 8,
            columnar_min_fields: 2,
        }
    }
}

/// Errors raised while decompressing an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unsupported compression envelope")]
    UnsupportedEnvelope,
    #[error("invalid or missing key dictionary in envelope")]
    MissingKeys,
}

/// Session-scoped registry of alias tables, keyed by `kdict-<12 hex>`.
///
/// The first time a table is seen its `keys` ship inline; identical reuse
/// ships only `keysRef`, re-bootstrapping every `bootstrap_interval` uses
/// so a fresh client can catch up.
#[derive(Debug, Default)]
pub struct KeyDictionaryRegistry {
    tables: HashMap<String, Map<String, Value>>,
    counters: HashMap<String, u64>,
    bootstrap_interval: u64,
}

impl KeyDictionaryRegistry {
    pub fn new(bootstrap_interval: u64) -> Self {
        Self {
            tables: HashMap::new(),
            counters: HashMap::new(),
            bootstrap_interval,
        }
    }

    /// Records a sighting of `table`; returns whether the inline `keys`
    /// field must be shipped for this envelope.
    fn observe(&mut self, reference: &str, table: &Map<String, Value>) -> bool {
        if self.tables.get(reference) == Some(table) {
            let count = self.counters.entry(reference.to_string()).or_insert(0);
            *count += 1;
            self.bootstrap_interval > 0 && *count % self.bootstrap_interval == 0
        } else {
            self.tables.insert(reference.to_string(), table.clone());
            self.counters.insert(reference.to_string(), 1);
            true
        }
    }

    pub fn lookup(&self, reference: &str) -> Option<&Map<String, Value>> {
        self.tables.get(reference)
    }
}

fn key_ref(alias_to_key: &Map<String, Value>) -> String {
    let digest = Sha256::digest(canonical_json(&Value::Object(alias_to_key.clone())).as_bytes());
    format!("kdict-{}", &crate::json::hex_encode(&digest)[..12])
}

/// First-seen-ordered key frequency table over the whole tree.
fn collect_key_frequency(node: &Value, order: &mut Vec<String>, counts: &mut HashMap<String, u64>) {
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                if !counts.contains_key(key) {
                    order.push(key.clone());
                }
                *counts.entry(key.clone()).or_insert(0) += 1;
                collect_key_frequency(value, order, counts);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_key_frequency(item, order, counts);
            }
        }
        _ => {}
    }
}

/// Builds the key→alias table: `k0, k1, …` ranked by frequency then
/// length, keeping only aliases strictly shorter than the original key.
fn build_key_aliases(
    order: &[String],
    counts: &HashMap<String, u64>,
    mode: CompressionMode,
) -> HashMap<String, String> {
    if mode == CompressionMode::Off {
        return HashMap::new();
    }
    let min_freq = if mode == CompressionMode::Aggressive { 1 } else { 2 };
    let mut candidates: Vec<(&String, u64)> = order
        .iter()
        .filter_map(|key| {
            let freq = counts.get(key).copied().unwrap_or(0);
            (freq >= min_freq && key.len() > 2).then_some((key, freq))
        })
        .collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.len().cmp(&a.0.len())));

    let mut aliases = HashMap::new();
    for (idx, (key, _)) in candidates.into_iter().enumerate() {
        let alias = format!("k{idx}");
        if alias.len() < key.len() {
            aliases.insert(key.clone(), alias);
        }
    }
    aliases
}

fn is_defaultish(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// Checks whether `items` is a homogeneous array of objects and returns
/// the column order taken from the first row.
fn columnar_columns(items: &[Value], opts: &CompressionOptions) -> Option<Vec<String>> {
    if !opts.enable_columnar || items.len() < opts.columnar_min_rows {
        return None;
    }
    let first = items.first()?.as_object()?;
    if first.len() < opts.columnar_min_fields {
        return None;
    }
    let first_set: HashSet<&String> = first.keys().collect();
    for item in &items[1..] {
        let map = item.as_object()?;
        if map.len() != first_set.len() || !map.keys().all(|k| first_set.contains(k)) {
            return None;
        }
    }
    Some(first.keys().cloned().collect())
}

fn encode(node: &Value, aliases: &HashMap<String, String>, opts: &CompressionOptions) -> Value {
    match node {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                if opts.strip_nulls && value.is_null() {
                    continue;
                }
                if opts.strip_defaults
                    && matches!(key.to_lowercase().as_str(), "default" | "defaults")
                    && is_defaultish(value)
                {
                    continue;
                }
                let encoded_key = aliases.get(key).cloned().unwrap_or_else(|| key.clone());
                out.insert(encoded_key, encode(value, aliases, opts));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if let Some(columns) = columnar_columns(items, opts) {
                let encoded_columns: Vec<Value> = columns
                    .iter()
                    .map(|col| json!(aliases.get(col).cloned().unwrap_or_else(|| col.clone())))
                    .collect();
                let rows: Vec<Value> = items
                    .iter()
                    .map(|item| {
                        let obj = item.as_object().expect("columnar rows are objects");
                        Value::Array(
                            columns
                                .iter()
                                .map(|col| encode(&obj[col], aliases, opts))
                                .collect(),
                        )
                    })
                    .collect();
                json!({"~t": {"c": encoded_columns, "r": rows}})
            } else {
                Value::Array(items.iter().map(|item| encode(item, aliases, opts)).collect())
            }
        }
        other => other.clone(),
    }
}

fn decode(node: &Value, alias_to_key: &Map<String, Value>) -> Value {
    match node {
        Value::Object(map) => {
            if let Some(Value::Object(meta)) = map.get("~t") {
                if let (Some(Value::Array(columns)), Some(Value::Array(rows))) =
                    (meta.get("c"), meta.get("r"))
                {
                    let decoded_cols: Vec<String> = columns
                        .iter()
                        .map(|col| {
                            let name = col.as_str().unwrap_or_default();
                            alias_to_key
                                .get(name)
                                .and_then(Value::as_str)
                                .unwrap_or(name)
                                .to_string()
                        })
                        .collect();
                    let mut decoded_items = Vec::with_capacity(rows.len());
                    for row in rows {
                        let Some(cells) = row.as_array() else {
                            continue;
                        };
                        let mut obj = Map::with_capacity(decoded_cols.len());
                        for (idx, col) in decoded_cols.iter().enumerate() {
                            if let Some(cell) = cells.get(idx) {
                                obj.insert(col.clone(), decode(cell, alias_to_key));
                            }
                        }
                        decoded_items.push(Value::Object(obj));
                    }
                    return Value::Array(decoded_items);
                }
            }
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                let decoded_key = alias_to_key
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or(key)
                    .to_string();
                out.insert(decoded_key, decode(value, alias_to_key));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| decode(item, alias_to_key)).collect())
        }
        other => other.clone(),
    }
}

fn uncompressed_envelope(input: &Value, original_bytes: usize) -> Value {
    json!({
        "encoding": RESULT_ENCODING,
        "compressed": false,
        "originalBytes": original_bytes,
        "compressedBytes": original_bytes,
        "savedBytes": 0,
        "savedRatio": 0.0,
        "data": input.clone(),
        "keys": {},
    })
}

/// Compresses a structured JSON payload into a self-describing envelope.
///
/// The envelope always round-trips: `decompress_result` on the output
/// yields `input` exactly. When the transform does not shrink the
/// payload, the envelope degrades to an uncompressed pass-through.
pub fn compress_result(
    input: &Value,
    opts: &CompressionOptions,
    registry: Option<&mut KeyDictionaryRegistry>,
) -> Value {
    let original_bytes = json_size(input);
    if original_bytes < opts.min_payload_bytes {
        return uncompressed_envelope(input, original_bytes);
    }

    let mut order = Vec::new();
    let mut counts = HashMap::new();
    collect_key_frequency(input, &mut order, &mut counts);
    let aliases = build_key_aliases(&order, &counts, opts.mode);
    let encoded = encode(input, &aliases, opts);

    let mut alias_to_key = Map::new();
    for key in &order {
        if let Some(alias) = aliases.get(key) {
            alias_to_key.insert(alias.clone(), json!(key));
        }
    }

    let mut envelope = Map::new();
    envelope.insert("encoding".into(), json!(RESULT_ENCODING));
    envelope.insert("compressed".into(), json!(true));
    envelope.insert("mode".into(), json!(opts.mode.as_str()));
    envelope.insert("originalBytes".into(), json!(original_bytes));
    envelope.insert("data".into(), encoded);
    envelope.insert("keys".into(), Value::Object(alias_to_key.clone()));

    if let Some(registry) = registry {
        let reference = key_ref(&alias_to_key);
        let include_keys = registry.observe(&reference, &alias_to_key);
        envelope.insert("keysRef".into(), json!(reference));
        if !include_keys {
            envelope.remove("keys");
        }
    }

    let compressed_bytes = json_size(&Value::Object(envelope.clone()));
    let saved = original_bytes as i64 - compressed_bytes as i64;
    if saved <= 0 {
        return uncompressed_envelope(input, original_bytes);
    }
    envelope.insert("compressedBytes".into(), json!(compressed_bytes));
    envelope.insert("savedBytes".into(), json!(saved));
    envelope.insert(
        "savedRatio".into(),
        json!(saved as f64 / original_bytes as f64),
    );
    Value::Object(envelope)
}

/// Inverts an envelope produced by [`compress_result`].
pub fn decompress_result(
    envelope: &Value,
    registry: Option<&KeyDictionaryRegistry>,
) -> Result<Value, EnvelopeError> {
    let map = envelope.as_object().ok_or(EnvelopeError::UnsupportedEnvelope)?;
    if map.get("encoding").and_then(Value::as_str) != Some(RESULT_ENCODING) {
        return Err(EnvelopeError::UnsupportedEnvelope);
    }
    let data = map.get("data").cloned().unwrap_or(Value::Null);
    if map.get("compressed").and_then(Value::as_bool) != Some(true) {
        return Ok(data);
    }

    let inline_keys = map.get("keys").and_then(Value::as_object);
    let registry_keys = map
        .get("keysRef")
        .and_then(Value::as_str)
        .and_then(|reference| registry.and_then(|r| r.lookup(reference)));
    let keys = inline_keys.or(registry_keys).ok_or(EnvelopeError::MissingKeys)?;
    Ok(decode(&data, keys))
}

/// Positive when `candidate` uses fewer estimated tokens than `original`.
pub fn token_savings(original: &Value, candidate: &Value, counter: &TokenCounter) -> i64 {
    counter.count(original) as i64 - counter.count(candidate) as i64
}

/// Scores how much a payload is likely to benefit from structural
/// compression, in `[0, 1]`.
///
/// Combines repeated-key ratio (weight 0.5), repeated-scalar ratio
/// (0.25), and the share of homogeneous object arrays (0.25).
pub fn estimate_compressibility(value: &Value) -> f64 {
    let mut key_counts: HashMap<String, u64> = HashMap::new();
    let mut scalar_counts: HashMap<String, u64> = HashMap::new();
    let mut homogeneous_lists = 0u64;
    let mut total_lists = 0u64;

    fn walk(
        node: &Value,
        key_counts: &mut HashMap<String, u64>,
        scalar_counts: &mut HashMap<String, u64>,
        homogeneous_lists: &mut u64,
        total_lists: &mut u64,
    ) {
        match node {
            Value::Object(map) => {
                for (key, child) in map {
                    *key_counts.entry(key.clone()).or_insert(0) += 1;
                    walk(child, key_counts, scalar_counts, homogeneous_lists, total_lists);
                }
            }
            Value::Array(items) => {
                *total_lists += 1;
                if !items.is_empty() && items.iter().all(Value::is_object) {
                    let keyset = |item: &Value| {
                        let mut keys: Vec<String> =
                            item.as_object().unwrap().keys().cloned().collect();
                        keys.sort();
                        keys
                    };
                    let first = keyset(&items[0]);
                    if items[1..].iter().all(|item| keyset(item) == first) {
                        *homogeneous_lists += 1;
                    }
                }
                for child in items {
                    walk(child, key_counts, scalar_counts, homogeneous_lists, total_lists);
                }
            }
            other => {
                let marker = serde_json::to_string(other).unwrap_or_default();
                *scalar_counts.entry(marker).or_insert(0) += 1;
            }
        }
    }

    walk(
        value,
        &mut key_counts,
        &mut scalar_counts,
        &mut homogeneous_lists,
        &mut total_lists,
    );

    let total_keys: u64 = key_counts.values().sum();
    let duplicate_keys = total_keys.saturating_sub(key_counts.len() as u64);
    let key_repeat_ratio = if total_keys > 0 {
        duplicate_keys as f64 / total_keys as f64
    } else {
        0.0
    };

    let total_scalars: u64 = scalar_counts.values().sum();
    let duplicate_scalars = total_scalars.saturating_sub(scalar_counts.len() as u64);
    let scalar_repeat_ratio = if total_scalars > 0 {
        duplicate_scalars as f64 / total_scalars as f64
    } else {
        0.0
    };

    let homogeneous_ratio = if total_lists > 0 {
        homogeneous_lists as f64 / total_lists as f64
    } else {
        0.0
    };

    let score = 0.5 * key_repeat_ratio + 0.25 * scalar_repeat_ratio + 0.25 * homogeneous_ratio;
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aggressive() -> CompressionOptions {
        CompressionOptions {
            mode: CompressionMode::Aggressive,
            min_payload_bytes: 0,
            ..Default::default()
        }
    }

    #[test]
    fn compress_and_decompress_roundtrip() {
        let names = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta"];
        let data = json!({
            "repositories": names
                .iter()
                .enumerate()
                .map(|(i, name)| json!({
                    "repository_name": name,
                    "repository_description": format!("Repository number {i} in the fleet"),
                    "repository_owner": format!("team-{i}"),
                }))
                .collect::<Vec<_>>()
        });
        let envelope = compress_result(&data, &aggressive(), None);
        assert_eq!(envelope["compressed"], json!(true));
        assert!(!envelope["keys"].as_object().unwrap().is_empty());
        let reconstructed = decompress_result(&envelope, None).expect("decompress");
        assert_eq!(reconstructed, data);
    }

    #[test]
    fn small_payload_returns_uncompressed() {
        let payload = json!({"a": 1});
        let opts = CompressionOptions {
            min_payload_bytes: 1024,
            ..Default::default()
        };
        let envelope = compress_result(&payload, &opts, None);
        assert_eq!(envelope["compressed"], json!(false));
        assert_eq!(envelope["data"], payload);
        assert_eq!(decompress_result(&envelope, None).unwrap(), payload);
    }

    #[test]
    fn columnar_packing_roundtrips_homogeneous_arrays() {
        let data = json!({
            "items": (0..30)
                .map(|i| json!({
                    "very_long_common_key_name": i,
                    "another_repeated_field_name": i * 2,
                    "third_repeated_property_name": i.to_string(),
                }))
                .collect::<Vec<_>>()
        });
        let envelope = compress_result(&data, &aggressive(), None);
        assert_eq!(envelope["compressed"], json!(true));
        assert!(envelope["savedBytes"].as_i64().unwrap() > 0);
        let encoded = serde_json::to_string(&envelope["data"]).unwrap();
        assert!(encoded.contains("~t"), "expected columnar packing: {encoded}");
        assert_eq!(decompress_result(&envelope, None).unwrap(), data);
    }

    #[test]
    fn shared_key_registry_elides_keys_on_reuse() {
        let data = json!({
            "records": (0..20)
                .map(|i| json!({"record_identifier": i, "record_payload": format!("value-{i}")}))
                .collect::<Vec<_>>()
        });
        let mut registry = KeyDictionaryRegistry::new(8);

        let first = compress_result(&data, &aggressive(), Some(&mut registry));
        assert!(first.get("keys").is_some());
        let reference = first["keysRef"].as_str().unwrap().to_string();
        assert!(reference.starts_with("kdict-"));

        let second = compress_result(&data, &aggressive(), Some(&mut registry));
        assert!(second.get("keys").is_none());
        assert_eq!(second["keysRef"], json!(reference));

        // A reader holding the registry can still invert the elided envelope.
        let reconstructed = decompress_result(&second, Some(&registry)).expect("decompress");
        assert_eq!(reconstructed, data);

        // Without the registry the elided envelope is undecodable.
        assert!(matches!(
            decompress_result(&second, None),
            Err(EnvelopeError::MissingKeys)
        ));
    }

    #[test]
    fn key_registry_bootstraps_periodically() {
        let data = json!({
            "records": (0..20)
                .map(|i| json!({"record_identifier": i, "record_payload": format!("value-{i}")}))
                .collect::<Vec<_>>()
        });
        let mut registry = KeyDictionaryRegistry::new(3);
        let mut inline_count = 0;
        for _ in 0..7 {
            let envelope = compress_result(&data, &aggressive(), Some(&mut registry));
            if envelope.get("keys").is_some() {
                inline_count += 1;
            }
        }
        // First sighting plus every third reuse re-ships the dictionary.
        assert_eq!(inline_count, 3);
    }

    #[test]
    fn strip_nulls_drops_null_members() {
        // Columnar packing is disabled: rows keep their object shape, so
        // the per-object null stripping is observable.
        let data = json!({
            "rows": (0..12)
                .map(|i| json!({"identifier_field": i, "annotation_field": Value::Null}))
                .collect::<Vec<_>>()
        });
        let opts = CompressionOptions {
            strip_nulls: true,
            enable_columnar: false,
            ..aggressive()
        };
        let envelope = compress_result(&data, &opts, None);
        let text = serde_json::to_string(&envelope["data"]).unwrap();
        assert!(!text.contains("null"), "nulls should be stripped: {text}");
    }

    #[test]
    fn compressibility_score_higher_for_repetitive_payloads() {
        let repetitive = json!({
            "items": (0..30)
                .map(|_| json!({"service": "api", "region": "us-east-1", "status": "ok"}))
                .collect::<Vec<_>>()
        });
        let diverse = json!({
            "items": (0..30)
                .map(|i| json!({"id": i, "name": format!("n{i}"), "value": i * 13}))
                .collect::<Vec<_>>()
        });
        assert!(estimate_compressibility(&repetitive) > estimate_compressibility(&diverse));
    }

    #[test]
    fn decompress_rejects_unknown_encoding() {
        assert!(matches!(
            decompress_result(&json!({"encoding": "unknown"}), None),
            Err(EnvelopeError::UnsupportedEnvelope)
        ));
    }
}
