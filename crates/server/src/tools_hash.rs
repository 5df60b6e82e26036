//! The negotiated tools-hash-sync extension.
//!
//! During `initialize` the client may advertise
//! `capabilities.experimental.ultra_lean_mcp_proxy.tools_hash_sync.version == 1`.
//! Once negotiated, `tools/list` requests can carry an `if_none_match`
//! hash; a match lets the proxy answer `not_modified` with an empty tool
//! array without touching the upstream. Without the advertisement the
//! whole feature stays dormant and no extension fields are emitted.

use anyhow::{bail, Result};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::LazyLock;
use ulmp_core::{canonicalize, stable_hash};

/// JSON container key for every extension field, request and response side.
pub const EXTENSION_KEY: &str = "_ultra_lean_mcp_proxy";

static WIRE_HASH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9_]+):([0-9a-f]{64})$").expect("WIRE_HASH: compile-time constant")
});

/// Validates and normalizes an `if_none_match` wire value.
///
/// Returns the lowercase `sha256:<hex>` form when well-formed and the
/// algorithm matches, else `None`.
pub fn parse_if_none_match(value: &Value, expected_algorithm: &str) -> Option<String> {
    let text = value.as_str()?;
    let candidate = text.trim().to_lowercase();
    let captures = WIRE_HASH.captures(&candidate)?;
    if &captures[1] != expected_algorithm {
        return None;
    }
    Some(candidate)
}

/// Computes the wire-format hash over a visible tools payload.
///
/// The preimage is the canonicalized tools array, or
/// `{tools, server_fingerprint}` when fingerprint binding is on.
pub fn compute_tools_hash(
    tools_payload: &Value,
    algorithm: &str,
    include_server_fingerprint: bool,
    server_fingerprint: &str,
) -> Result<String> {
    if algorithm != "sha256" {
        bail!("unsupported tools hash algorithm: {algorithm}");
    }
    let payload = canonicalize(tools_payload);
    let preimage = if include_server_fingerprint {
        json!({
            "tools": payload,
            "server_fingerprint": server_fingerprint,
        })
    } else {
        payload
    };
    Ok(format!("sha256:{}", stable_hash(&preimage)))
}

/// Whether the client's initialize params advertise the extension.
pub fn client_supports_tools_hash_sync(params: Option<&Value>) -> bool {
    let version = params
        .and_then(Value::as_object)
        .and_then(|p| p.get("capabilities"))
        .and_then(Value::as_object)
        .and_then(|caps| caps.get("experimental"))
        .and_then(Value::as_object)
        .and_then(|exp| exp.get("ultra_lean_mcp_proxy"))
        .and_then(Value::as_object)
        .and_then(|ext| ext.get("tools_hash_sync"))
        .and_then(Value::as_object)
        .and_then(|sync| sync.get("version"));
    match version {
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s.trim() == "1",
        _ => false,
    }
}

/// The `(provided, valid, normalized)` triple for a `tools/list` request's
/// conditional field.
pub fn extract_if_none_match(
    params: Option<&Value>,
    algorithm: &str,
) -> (bool, bool, Option<String>) {
    let Some(if_none_match) = params
        .and_then(Value::as_object)
        .and_then(|p| p.get(EXTENSION_KEY))
        .and_then(Value::as_object)
        .and_then(|ext| ext.get("tools_hash_sync"))
        .and_then(Value::as_object)
        .and_then(|sync| sync.get("if_none_match"))
    else {
        return (false, false, None);
    };
    if if_none_match.is_null() {
        return (false, false, None);
    }
    match parse_if_none_match(if_none_match, algorithm) {
        Some(normalized) => (true, true, Some(normalized)),
        None => (true, false, None),
    }
}

/// Marks the upstream initialize result with the negotiated capability.
/// Any non-object shape along the path fails open to the original value.
pub fn inject_initialize_capability(result: &Value, algorithm: &str) -> Value {
    let Some(result_map) = result.as_object() else {
        return result.clone();
    };
    let mut out = result_map.clone();

    let caps = out
        .entry("capabilities".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(caps_map) = caps.as_object_mut() else {
        return result.clone();
    };
    let experimental = caps_map
        .entry("experimental".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(experimental_map) = experimental.as_object_mut() else {
        return result.clone();
    };
    let proxy_ext = experimental_map
        .entry("ultra_lean_mcp_proxy".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(proxy_ext_map) = proxy_ext.as_object_mut() else {
        return result.clone();
    };
    proxy_ext_map.insert(
        "tools_hash_sync".to_string(),
        json!({"version": 1, "algorithm": algorithm}),
    );
    Value::Object(out)
}

/// Scope key for tools-hash bookkeeping.
pub fn scope_key(session_id: &str, server_name: &str, profile_fingerprint: &str) -> String {
    format!("{session_id}:{server_name}:{profile_fingerprint}")
}

/// Fingerprint binding a session to one upstream command line.
pub fn build_profile_fingerprint(server_name: &str, upstream_command: &[String]) -> String {
    stable_hash(&json!({
        "server_name": server_name,
        "command": upstream_command.join(" "),
    }))
}
