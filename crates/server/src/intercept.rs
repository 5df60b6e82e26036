//! The method-aware interception pipeline.
//!
//! Each function here is one post-processing step from the data-flow:
//! `tools/list` responses run definition compression, lazy visibility,
//! and tools-hash attachment; `tools/call` responses run result
//! compression, cache writes with adaptive TTL, mutation invalidation,
//! and the delta engine. Everything fails open: an error in any stage
//! forwards the original payload unchanged.

use crate::config::ProxyConfig;
use crate::health::FeatureOutcome;
use crate::lazy;
use crate::session::{PendingRequest, ProxySession};
use crate::tools_hash::{self, EXTENSION_KEY};
use serde_json::{json, Map, Value};
use std::time::Duration;
use ulmp_core::{
    compress_description, compress_result, compress_schema, create_delta, estimate_compressibility,
    is_mutating_tool_name, json_size, make_cache_key, stable_hash, token_savings,
    CompressionOptions, DeltaOptions, DELTA_ENCODING,
};

/// Conditional-list state extracted from a `tools/list` request.
#[derive(Debug, Default, Clone)]
pub struct ToolsListConditional {
    pub provided: bool,
    pub valid: bool,
    pub value: Option<String>,
}

/// Tool name and argument object of a `tools/call` request.
pub fn extract_tool_call(msg: &Value) -> (Option<String>, Value) {
    let Some(params) = msg.get("params").and_then(Value::as_object) else {
        return (None, json!({}));
    };
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string);
    let arguments = match params.get("arguments") {
        Some(args @ Value::Object(_)) => args.clone(),
        _ => json!({}),
    };
    (name, arguments)
}

/// Compresses descriptions in place across a tool list.
pub fn apply_definition_compression(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut item = tool.clone();
            if let Some(map) = item.as_object_mut() {
                if let Some(Value::String(desc)) = map.get("description") {
                    let compressed = compress_description(desc);
                    map.insert("description".into(), Value::String(compressed));
                }
                let schema_key = if map.contains_key("inputSchema") {
                    Some("inputSchema")
                } else if map.contains_key("input_schema") {
                    Some("input_schema")
                } else {
                    None
                };
                if let Some(key) = schema_key {
                    if let Some(schema) = map.get_mut(key) {
                        compress_schema(schema);
                    }
                }
            }
            item
        })
        .collect()
}

/// Whether a tool call is eligible for the response cache.
pub fn tool_cache_allowed(cfg: &ProxyConfig, tool_name: Option<&str>) -> bool {
    let Some(tool_name) = tool_name else {
        return false;
    };
    if !cfg.caching_enabled {
        return false;
    }
    if !cfg.feature_enabled_for_tool(Some(tool_name), "caching", true) {
        return false;
    }
    if !cfg.cache_mutating_for_tool(tool_name) && is_mutating_tool_name(tool_name) {
        return false;
    }
    true
}

fn extension_entry<'a>(result: &'a mut Map<String, Value>) -> Option<&'a mut Map<String, Value>> {
    let ext = result
        .entry(EXTENSION_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !ext.is_object() {
        *ext = Value::Object(Map::new());
    }
    ext.as_object_mut()
}

/// Answers a conditional `tools/list` without touching the upstream when
/// the presented hash matches the scope's last hash, except for the
/// periodic forced refresh that bounds drift.
pub fn try_tools_list_short_circuit(
    session: &mut ProxySession,
    cfg: &ProxyConfig,
    profile_fingerprint: &str,
    if_none_match: &str,
) -> Option<Value> {
    let scope = tools_hash::scope_key(&cfg.session_id, &cfg.server_name, profile_fingerprint);
    let entry = session.state.tools_hash_get(&scope)?;
    if entry.last_hash.as_deref() != Some(if_none_match) {
        return None;
    }
    let next_hit = entry.conditional_hits + 1;
    if next_hit % cfg.tools_hash_sync_refresh_interval == 0 {
        return None;
    }
    session.state.tools_hash_record_hit(&scope);
    session.metrics.tools_hash_sync_hits += 1;
    session.metrics.tools_hash_sync_not_modified += 1;
    Some(json!({
        "tools": [],
        EXTENSION_KEY: {
            "tools_hash_sync": {
                "not_modified": true,
                "tools_hash": if_none_match,
            }
        },
    }))
}

/// Full `tools/list` response pipeline: definition compression, catalog
/// store, lazy view, hash attachment, and conditional not-modified.
pub fn handle_tools_list_result(
    result: &Value,
    session: &mut ProxySession,
    cfg: &ProxyConfig,
    profile_fingerprint: &str,
    negotiated: bool,
    conditional: &ToolsListConditional,
) -> Value {
    let Some(tools) = result.get("tools").and_then(Value::as_array) else {
        return result.clone();
    };

    session.metrics.tools_list_requests += 1;
    let original_size = json_size(result);

    let processed = if cfg.definition_compression_enabled {
        apply_definition_compression(tools)
    } else {
        tools.clone()
    };

    // Index the full catalog for the lazy search meta-tool.
    session.state.set_tools(&processed);

    let visible = if lazy::lazy_allowed(cfg, &processed, &session.token_counter) {
        lazy::visible_tools(cfg, &processed)
    } else {
        processed
    };

    let mut out = result.as_object().cloned().unwrap_or_default();
    out.insert("tools".into(), Value::Array(visible));
    let out_value = Value::Object(out);
    let saved = original_size.saturating_sub(json_size(&out_value));
    if saved > 0 {
        session.metrics.tools_list_saved_bytes += saved as u64;
    }

    if !(cfg.tools_hash_sync_enabled && negotiated) {
        return out_value;
    }

    let scope = tools_hash::scope_key(&cfg.session_id, &cfg.server_name, profile_fingerprint);
    let visible_value = out_value.get("tools").cloned().unwrap_or_else(|| json!([]));
    let tools_hash = match tools_hash::compute_tools_hash(
        &visible_value,
        &cfg.tools_hash_sync_algorithm,
        cfg.tools_hash_sync_include_server_fingerprint,
        profile_fingerprint,
    ) {
        Ok(hash) => hash,
        Err(err) => {
            tracing::debug!(
                target: "ulmp::tools_hash",
                error = %err,
                "tools_hash_sync skipped (fail-open)"
            );
            return out_value;
        }
    };
    session.state.tools_hash_set_last(&scope, &tools_hash);

    let conditional_match = conditional.valid && conditional.value.as_deref() == Some(&tools_hash);
    if conditional_match {
        let hit_count = session.state.tools_hash_record_hit(&scope);
        session.metrics.tools_hash_sync_hits += 1;
        let force_refresh = hit_count % cfg.tools_hash_sync_refresh_interval == 0;
        if !force_refresh {
            let mut not_modified = out_value.as_object().cloned().unwrap_or_default();
            not_modified.insert("tools".into(), json!([]));
            if let Some(ext) = extension_entry(&mut not_modified) {
                ext.insert(
                    "tools_hash_sync".into(),
                    json!({"not_modified": true, "tools_hash": tools_hash}),
                );
            }
            let not_modified = Value::Object(not_modified);

            session.metrics.tools_hash_sync_not_modified += 1;
            let byte_delta = json_size(&out_value).saturating_sub(json_size(&not_modified));
            session.metrics.tools_hash_sync_saved_bytes += byte_delta as u64;
            let token_delta = session
                .token_counter
                .count(&out_value)
                .saturating_sub(session.token_counter.count(&not_modified));
            session.metrics.tools_hash_sync_saved_tokens += token_delta as u64;
            return not_modified;
        }
    } else if conditional.provided && conditional.valid {
        session.metrics.tools_hash_sync_misses += 1;
    }

    session.state.tools_hash_reset_hits(&scope);
    let mut out = out_value.as_object().cloned().unwrap_or_default();
    if let Some(ext) = extension_entry(&mut out) {
        ext.insert(
            "tools_hash_sync".into(),
            json!({"not_modified": false, "tools_hash": tools_hash}),
        );
    }
    Value::Object(out)
}

/// Drops `content[]` text items that redundantly embed the same JSON
/// payload as the structured result.
fn minify_redundant_text_content(content: &[Value], original_payload: &Value) -> (Vec<Value>, bool) {
    let mut kept = Vec::with_capacity(content.len());
    let mut removed = false;
    for item in content {
        let redundant = item
            .as_object()
            .filter(|map| map.get("type").and_then(Value::as_str) == Some("text"))
            .and_then(|map| map.get("text"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| text.starts_with('{') || text.starts_with('['))
            .and_then(|text| serde_json::from_str::<Value>(text).ok())
            .is_some_and(|parsed| &parsed == original_payload);
        if redundant {
            removed = true;
        } else {
            kept.push(item.clone());
        }
    }
    if removed && kept.is_empty() {
        kept.push(json!({"type": "text", "text": "[ultra-lean-mcp-proxy] structured result"}));
    }
    (kept, removed)
}

fn compression_options(cfg: &ProxyConfig) -> CompressionOptions {
    CompressionOptions {
        mode: cfg.result_compression_mode,
        strip_nulls: cfg.result_strip_nulls,
        strip_defaults: cfg.result_strip_defaults,
        min_payload_bytes: cfg.result_min_payload_bytes,
        ..Default::default()
    }
}

/// Applies result compression to a tool-call result, preferring the
/// structured-content field and falling back to JSON-bearing text items.
pub fn apply_result_compression(
    result: &Value,
    tool_name: Option<&str>,
    session: &mut ProxySession,
    cfg: &ProxyConfig,
) -> Value {
    if !cfg.result_compression_enabled {
        return result.clone();
    }
    if !cfg.feature_enabled_for_tool(tool_name, "result_compression", true) {
        return result.clone();
    }
    if !session.health.is_active("result_compression", tool_name, cfg) {
        return result.clone();
    }

    let opts = compression_options(cfg);
    let ProxySession {
        metrics,
        health,
        token_counter,
        key_registry,
        ..
    } = session;
    let mut outcome = FeatureOutcome::Neutral;

    // Preferred target: structured content.
    if let Some(original) = result
        .get("structuredContent")
        .filter(|v| v.is_object() || v.is_array())
    {
        if estimate_compressibility(original) < cfg.result_min_compressibility {
            health.record("result_compression", tool_name, FeatureOutcome::Neutral, cfg);
            return result.clone();
        }
        let registry = cfg.result_shared_key_registry.then_some(&mut *key_registry);
        let envelope = compress_result(original, &opts, registry);
        let mut compressed_out: Option<Value> = None;
        if envelope.get("compressed").and_then(Value::as_bool) == Some(true) {
            let token_delta = token_savings(original, &envelope, token_counter);
            let min_required = std::cmp::max(
                cfg.result_min_token_savings_abs as i64,
                (token_counter.count(original) as f64 * cfg.result_min_token_savings_ratio) as i64,
            );
            if token_delta >= min_required {
                let mut out = result.as_object().cloned().unwrap_or_default();
                let saved_bytes = envelope.get("savedBytes").and_then(Value::as_u64).unwrap_or(0);
                let saved_ratio = envelope.get("savedRatio").and_then(Value::as_f64).unwrap_or(0.0);
                out.insert("structuredContent".into(), envelope);
                if let Some(ext) = extension_entry(&mut out) {
                    ext.insert(
                        "result_compression".into(),
                        json!({
                            "saved_bytes": saved_bytes,
                            "saved_ratio": saved_ratio,
                            "saved_tokens": token_delta,
                        }),
                    );
                }
                metrics.result_compressions += 1;
                metrics.result_saved_bytes += saved_bytes;
                outcome = FeatureOutcome::Success;
                if cfg.result_minify_redundant_text {
                    if let Some(content) = out.get("content").and_then(Value::as_array) {
                        let (kept, changed) = minify_redundant_text_content(content, original);
                        if changed {
                            out.insert("content".into(), Value::Array(kept));
                        }
                    }
                }
                compressed_out = Some(Value::Object(out));
            } else if token_delta < 0 {
                outcome = FeatureOutcome::Hurt;
            }
        }
        health.record("result_compression", tool_name, outcome, cfg);
        return compressed_out.unwrap_or_else(|| result.clone());
    }

    // Fallback: text content items that parse as JSON.
    if let Some(content) = result.get("content").and_then(Value::as_array) {
        let mut out = result.as_object().cloned().unwrap_or_default();
        let mut new_content = content.clone();
        let mut changed = false;
        let mut total_saved: u64 = 0;
        let mut total_saved_tokens: i64 = 0;
        for item in new_content.iter_mut() {
            let Some(map) = item.as_object() else {
                continue;
            };
            if map.get("type").and_then(Value::as_str) != Some("text") {
                continue;
            }
            let Some(text) = map.get("text").and_then(Value::as_str) else {
                continue;
            };
            let stripped = text.trim();
            if !stripped.starts_with('{') && !stripped.starts_with('[') {
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<Value>(stripped) else {
                continue;
            };
            if estimate_compressibility(&parsed) < cfg.result_min_compressibility {
                continue;
            }
            let envelope = compress_result(
                &parsed,
                &opts,
                cfg.result_shared_key_registry.then_some(&mut *key_registry),
            );
            if envelope.get("compressed").and_then(Value::as_bool) != Some(true) {
                continue;
            }
            let token_delta = token_savings(&parsed, &envelope, token_counter);
            let min_required = std::cmp::max(
                cfg.result_min_token_savings_abs as i64,
                (token_counter.count(&parsed) as f64 * cfg.result_min_token_savings_ratio) as i64,
            );
            if token_delta >= min_required {
                let saved = envelope.get("savedBytes").and_then(Value::as_u64).unwrap_or(0);
                item.as_object_mut().expect("checked above").insert(
                    "text".into(),
                    json!(serde_json::to_string(&envelope).unwrap_or_default()),
                );
                changed = true;
                total_saved += saved;
                total_saved_tokens += token_delta;
                outcome = FeatureOutcome::Success;
            } else if token_delta < 0 && outcome != FeatureOutcome::Success {
                outcome = FeatureOutcome::Hurt;
            }
        }
        if changed {
            out.insert("content".into(), Value::Array(new_content));
            if let Some(ext) = extension_entry(&mut out) {
                ext.insert(
                    "result_compression".into(),
                    json!({"saved_bytes": total_saved, "saved_tokens": total_saved_tokens}),
                );
            }
            metrics.result_compressions += 1;
            metrics.result_saved_bytes += total_saved;
            health.record("result_compression", tool_name, FeatureOutcome::Success, cfg);
            return Value::Object(out);
        }
        health.record("result_compression", tool_name, outcome, cfg);
        return result.clone();
    }

    health.record("result_compression", tool_name, FeatureOutcome::Neutral, cfg);
    result.clone()
}

/// Runs the delta engine for one delivery, updating history either way.
pub fn apply_delta_response(
    result: &Value,
    history_key: &str,
    tool_name: Option<&str>,
    session: &mut ProxySession,
    cfg: &ProxyConfig,
) -> Value {
    let previous = session.state.history_get(history_key);
    session.state.history_set(history_key, result);

    if !cfg.delta_responses_enabled {
        return result.clone();
    }
    if !cfg.feature_enabled_for_tool(tool_name, "delta_responses", true) {
        return result.clone();
    }
    let Some(previous) = previous else {
        session.delta_counters.insert(history_key.to_string(), 0);
        return result.clone();
    };
    // Periodic full snapshot bounds unbounded patch chains.
    if session.delta_counters.get(history_key).copied().unwrap_or(0) >= cfg.delta_snapshot_interval
    {
        session.delta_counters.insert(history_key.to_string(), 0);
        return result.clone();
    }

    let full_tokens = session.token_counter.count(result);

    let (payload, saved_bytes) = if previous == *result {
        let payload = json!({
            "delta": {
                "encoding": DELTA_ENCODING,
                "unchanged": true,
                "currentHash": stable_hash(result),
            }
        });
        let saved = json_size(result).saturating_sub(json_size(&payload)) as u64;
        (payload, saved)
    } else {
        let delta = match create_delta(
            &previous,
            result,
            &DeltaOptions {
                min_savings_ratio: cfg.delta_min_savings_ratio,
                max_patch_bytes: cfg.delta_max_patch_bytes,
            },
        ) {
            Some(delta) => delta,
            None => return result.clone(),
        };
        let full_bytes = delta.get("fullBytes").and_then(Value::as_f64).unwrap_or(0.0);
        let patch_bytes = delta.get("patchBytes").and_then(Value::as_f64).unwrap_or(0.0);
        let patch_ratio = if full_bytes > 0.0 { patch_bytes / full_bytes } else { 0.0 };
        if patch_ratio > cfg.delta_max_patch_ratio {
            return result.clone();
        }
        // Savings as accounted by the envelope itself: full payload
        // minus the ops array, not minus the whole envelope.
        let saved = delta.get("savedBytes").and_then(Value::as_u64).unwrap_or(0);
        (json!({"delta": delta}), saved)
    };

    if session.token_counter.count(&payload) >= full_tokens {
        return result.clone();
    }

    *session
        .delta_counters
        .entry(history_key.to_string())
        .or_insert(0) += 1;
    session.metrics.delta_responses += 1;
    session.metrics.delta_saved_bytes += saved_bytes;
    json!({
        "structuredContent": payload,
        "content": [{
            "type": "text",
            "text": serde_json::to_string(&payload).unwrap_or_default(),
        }],
    })
}

/// Full `tools/call` response pipeline: raw capture, result compression,
/// mutation invalidation, cache write with adaptive TTL, delta delivery.
pub fn handle_tools_call_response(
    result: &Value,
    pending: &PendingRequest,
    session: &mut ProxySession,
    cfg: &ProxyConfig,
) -> Value {
    let raw_upstream_result = result.clone();
    let tool_name = pending.tool_name.as_deref();
    let result = apply_result_compression(result, tool_name, session, cfg);

    // Mutating/stateful calls invalidate prior cached reads for this
    // session+server scope.
    if let Some(tool) = tool_name {
        if cfg.caching_enabled && !cfg.cache_mutating_for_tool(tool) && is_mutating_tool_name(tool)
        {
            let scope_prefix = format!("{}:{}:", cfg.session_id, cfg.server_name);
            session.state.cache_invalidate_prefix(&scope_prefix);
            session
                .state
                .history_invalidate_prefix(&format!("cache_raw:{scope_prefix}"));
        }
    }

    if let Some(cache_key) = pending.cache_key.as_deref() {
        if tool_cache_allowed(cfg, tool_name) {
            let base_ttl = cfg.cache_ttl_for_tool(tool_name);
            let mut ttl = base_ttl;
            if cfg.cache_adaptive_ttl && base_ttl > 0 {
                let raw_key = format!("cache_raw:{cache_key}");
                if let Some(previous_raw) = session.state.history_get(&raw_key) {
                    ttl = if previous_raw != raw_upstream_result {
                        std::cmp::max(cfg.cache_ttl_min_seconds, base_ttl / 2)
                    } else {
                        std::cmp::min(cfg.cache_ttl_max_seconds, base_ttl * 3 / 2)
                    };
                }
                ttl = ttl.clamp(cfg.cache_ttl_min_seconds, cfg.cache_ttl_max_seconds);
                session.state.history_set(&raw_key, &raw_upstream_result);
            }
            session
                .state
                .cache_set(cache_key, &result, Duration::from_secs(ttl));
        }
    }

    let history_key = pending.cache_key.clone().unwrap_or_else(|| {
        make_cache_key(
            &cfg.session_id,
            &cfg.server_name,
            tool_name.unwrap_or("_unknown"),
            pending.arguments.as_ref(),
        )
    });
    apply_delta_response(&result, &history_key, tool_name, session, cfg)
}
