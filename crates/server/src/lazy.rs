//! Lazy tool visibility and the local search meta-tool.
//!
//! When the catalog is large enough, the advertised tool list is replaced
//! with a reduced view and a synthetic search tool is appended. Calls to
//! the search tool are answered by the proxy from the stored catalog and
//! never reach the upstream.

use crate::config::{LazyMode, ProxyConfig};
use serde_json::{json, Map, Value};
use ulmp_core::{compress_description, TokenCounter};
use ulmp_state::ProxyState;

/// Wire name of the injected search meta-tool.
pub const SEARCH_TOOL_NAME: &str = "ultra_lean_mcp_proxy.search_tools";

/// Builds the search meta-tool definition. In catalog mode the full name
/// list is embedded in the description so the client can select directly.
pub fn build_search_tool_definition(tool_names: Option<&[String]>) -> Value {
    let base_desc = "Search available tools and return full schemas on demand.";
    let description = match tool_names {
        Some(names) if !names.is_empty() => format!(
            "{base_desc} Use \"select:<tool_name>\" for direct selection, or keywords to search.\n\n\
             Available tools (must be loaded via this tool before use):\n{}",
            names.join("\n")
        ),
        _ => base_desc.to_string(),
    };
    json!({
        "name": SEARCH_TOOL_NAME,
        "description": description,
        "inputSchema": {
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "server": {"type": "string", "description": "Optional server name"},
                "top_k": {"type": "integer", "description": "Max number of results", "default": 8},
                "include_schemas": {
                    "type": "boolean",
                    "description": "Include inputSchema in matches",
                    "default": false,
                },
            },
            "required": ["query"],
        },
    })
}

/// Strips schema metadata down to what a client needs to shape a call:
/// types, required lists, enums/formats/bounds, and (near the top only)
/// compressed descriptions.
pub fn strip_schema_metadata(schema: &Value, depth: usize) -> Value {
    let Some(map) = schema.as_object() else {
        return schema.clone();
    };
    let mut out = Map::new();
    if let Some(type_value) = map.get("type") {
        out.insert("type".into(), type_value.clone());
    }
    if let Some(Value::Array(required)) = map.get("required") {
        if !required.is_empty() {
            out.insert("required".into(), Value::Array(required.clone()));
        }
    }
    if let Some(Value::Array(variants)) = map.get("enum") {
        out.insert("enum".into(), Value::Array(variants.clone()));
    }
    for key in ["format", "pattern", "$ref"] {
        if let Some(Value::String(s)) = map.get(key) {
            out.insert(key.into(), Value::String(s.clone()));
        }
    }
    if let Some(const_value) = map.get("const") {
        out.insert("const".into(), const_value.clone());
    }
    for key in ["minimum", "maximum", "minLength", "maxLength", "minItems", "maxItems"] {
        if let Some(Value::Number(n)) = map.get(key) {
            out.insert(key.into(), Value::Number(n.clone()));
        }
    }
    if depth <= 1 {
        if let Some(Value::String(desc)) = map.get("description") {
            out.insert("description".into(), Value::String(compress_description(desc)));
        }
    }
    if let Some(Value::Object(props)) = map.get("properties") {
        let stripped: Map<String, Value> = props
            .iter()
            .map(|(name, prop)| (name.clone(), strip_schema_metadata(prop, depth + 1)))
            .collect();
        out.insert("properties".into(), Value::Object(stripped));
    }
    match map.get("items") {
        Some(Value::Array(items)) => {
            out.insert(
                "items".into(),
                Value::Array(items.iter().map(|s| strip_schema_metadata(s, depth + 1)).collect()),
            );
        }
        Some(items @ Value::Object(_)) => {
            out.insert("items".into(), strip_schema_metadata(items, depth + 1));
        }
        _ => {}
    }
    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(Value::Array(variants)) = map.get(key) {
            out.insert(
                key.into(),
                Value::Array(variants.iter().map(|s| strip_schema_metadata(s, depth + 1)).collect()),
            );
        }
    }
    if let Some(not_schema @ Value::Object(_)) = map.get("not") {
        out.insert("not".into(), strip_schema_metadata(not_schema, depth + 1));
    }
    Value::Object(out)
}

fn tool_schema(tool: &Value) -> Value {
    tool.get("inputSchema")
        .or_else(|| tool.get("input_schema"))
        .cloned()
        .unwrap_or_else(|| json!({}))
}

/// The `minimal` view of one tool: name, compressed description, and a
/// stripped schema preserving property names and types.
pub fn minimal_tool(tool: &Value) -> Value {
    let name = tool.get("name").cloned().unwrap_or_else(|| json!(""));
    let description = tool.get("description").and_then(Value::as_str).unwrap_or("");
    let compressed = compress_description(description);
    json!({
        "name": name,
        "description": if compressed.is_empty() { description.to_string() } else { compressed },
        "inputSchema": strip_schema_metadata(&tool_schema(tool), 0),
    })
}

/// Whether the lazy gate opens for this catalog.
pub fn lazy_allowed(cfg: &ProxyConfig, tools: &[Value], counter: &TokenCounter) -> bool {
    if !cfg.lazy_loading_enabled {
        return false;
    }
    let tool_tokens = counter.count(&json!({"tools": tools}));
    tools.len() >= cfg.lazy_min_tools || tool_tokens >= cfg.lazy_min_tokens
}

/// Computes the visible tool view for an active lazy mode, with the
/// search meta-tool appended.
pub fn visible_tools(cfg: &ProxyConfig, tools: &[Value]) -> Vec<Value> {
    let mut visible: Vec<Value> = match cfg.lazy_mode {
        LazyMode::SearchOnly => Vec::new(),
        LazyMode::Catalog => tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.get("name").cloned().unwrap_or_else(|| json!("")),
                    "inputSchema": {"type": "object"},
                })
            })
            .collect(),
        LazyMode::Minimal | LazyMode::Off => tools.iter().map(minimal_tool).collect(),
    };
    let tool_names: Option<Vec<String>> = match cfg.lazy_mode {
        LazyMode::Catalog => Some(
            tools
                .iter()
                .map(|tool| tool.get("name").and_then(Value::as_str).unwrap_or("").to_string())
                .collect(),
        ),
        _ => None,
    };
    visible.push(build_search_tool_definition(tool_names.as_deref()));
    visible
}

/// Answers a `tools/call` of the search meta-tool from the catalog.
pub fn build_search_result(state: &ProxyState, cfg: &ProxyConfig, arguments: &Value) -> Value {
    let query = arguments
        .get("query")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    let top_k = arguments
        .get("top_k")
        .and_then(Value::as_u64)
        .map(|v| (v as usize).max(1))
        .unwrap_or(cfg.lazy_top_k);
    let include_schemas = arguments
        .get("include_schemas")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let matches = state.search_tools(&query, top_k, include_schemas);
    let top_score = matches
        .first()
        .and_then(|m| m.get("score"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let mut payload = Map::new();
    payload.insert("server".into(), json!(cfg.server_name));
    payload.insert("query".into(), json!(query));
    payload.insert("count".into(), json!(matches.len()));
    payload.insert("matches".into(), Value::Array(matches));
    if cfg.lazy_fallback_full_on_low_confidence && top_score < cfg.lazy_min_confidence_score {
        payload.insert("fallback".into(), json!("full_tools_due_low_confidence"));
        payload.insert("top_score".into(), json!(top_score));
        payload.insert("tools".into(), Value::Array(state.tools()));
    }
    let payload = Value::Object(payload);

    json!({
        "structuredContent": payload,
        "content": [{
            "type": "text",
            "text": serde_json::to_string(&payload).unwrap_or_default(),
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog(count: usize) -> Vec<Value> {
        (0..count)
            .map(|i| {
                json!({
                    "name": format!("tool_{i}"),
                    "description": format!("Performs operation number {i} against the service."),
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "target": {"type": "string", "description": "Target resource"},
                            "limit": {"type": "integer"},
                        },
                        "required": ["target"],
                    },
                })
            })
            .collect()
    }

    fn lazy_cfg(mode: LazyMode) -> ProxyConfig {
        ProxyConfig {
            lazy_loading_enabled: true,
            lazy_mode: mode,
            lazy_min_tools: 10,
            lazy_min_tokens: 8000,
            ..Default::default()
        }
    }

    #[test]
    fn catalog_mode_sends_bare_stubs_plus_search_tool() {
        let cfg = lazy_cfg(LazyMode::Catalog);
        let tools = catalog(10);
        let visible = visible_tools(&cfg, &tools);
        assert_eq!(visible.len(), 11);
        let names: Vec<&str> = visible.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&SEARCH_TOOL_NAME));
        for stub in &visible[..10] {
            assert!(stub.get("description").is_none());
            assert_eq!(stub["inputSchema"], json!({"type": "object"}));
        }
        let search_tool = visible.last().unwrap();
        let desc = search_tool["description"].as_str().unwrap();
        assert!(desc.contains("Available tools"));
        assert!(desc.contains("select:"));
        for i in 0..10 {
            assert!(desc.contains(&format!("tool_{i}")));
        }
    }

    #[test]
    fn minimal_mode_keeps_property_names_and_types_only() {
        let cfg = lazy_cfg(LazyMode::Minimal);
        let tools = catalog(10);
        let visible = visible_tools(&cfg, &tools);
        assert_eq!(visible.len(), 11);

        let stub = &visible[0];
        assert_eq!(stub["name"], json!("tool_0"));
        assert_eq!(stub["inputSchema"]["type"], json!("object"));
        assert_eq!(stub["inputSchema"]["required"], json!(["target"]));
        assert_eq!(stub["inputSchema"]["properties"]["limit"], json!({"type": "integer"}));

        // Minimal mode does not embed the name list in the search tool.
        let search_tool = visible.last().unwrap();
        assert!(!search_tool["description"].as_str().unwrap().contains("Available tools"));
    }

    #[test]
    fn search_only_mode_ships_just_the_meta_tool() {
        let cfg = lazy_cfg(LazyMode::SearchOnly);
        let visible = visible_tools(&cfg, &catalog(10));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0]["name"], json!(SEARCH_TOOL_NAME));
    }

    #[test]
    fn lazy_gate_respects_tool_count_threshold() {
        let cfg = lazy_cfg(LazyMode::Minimal);
        let counter = TokenCounter::new();
        assert!(!lazy_allowed(&cfg, &catalog(3), &counter));
        assert!(lazy_allowed(&cfg, &catalog(10), &counter));
    }

    #[test]
    fn lazy_gate_opens_on_token_pressure_alone() {
        let cfg = ProxyConfig {
            lazy_min_tokens: 50,
            ..lazy_cfg(LazyMode::Minimal)
        };
        let counter = TokenCounter::new();
        assert!(lazy_allowed(&cfg, &catalog(2), &counter));
    }

    #[test]
    fn strip_preserves_nested_structure_and_constraints() {
        let schema = json!({
            "type": "object",
            "title": "Export settings",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "required": ["format"],
            "additionalProperties": false,
            "properties": {
                "format": {
                    "type": "object",
                    "required": ["type"],
                    "properties": {
                        "type": {"type": "string", "enum": ["pdf", "png", "jpg"]},
                        "quality": {"type": "integer", "minimum": 1, "maximum": 100, "default": 80},
                    },
                },
            },
        });
        let result = strip_schema_metadata(&schema, 0);
        assert_eq!(result["type"], json!("object"));
        assert_eq!(result["required"], json!(["format"]));
        assert!(result.get("title").is_none());
        assert!(result.get("$schema").is_none());
        assert!(result.get("additionalProperties").is_none());
        let fmt = &result["properties"]["format"];
        assert_eq!(fmt["required"], json!(["type"]));
        assert_eq!(fmt["properties"]["type"]["enum"], json!(["pdf", "png", "jpg"]));
        assert_eq!(fmt["properties"]["quality"]["minimum"], json!(1));
        assert_eq!(fmt["properties"]["quality"]["maximum"], json!(100));
        assert!(fmt["properties"]["quality"].get("default").is_none());
    }

    #[test]
    fn strip_drops_descriptions_below_depth_one() {
        let schema = json!({
            "type": "object",
            "description": "Top level object describing the entire request payload.",
            "properties": {
                "child": {
                    "type": "object",
                    "description": "A nested child object with its own description text.",
                    "properties": {
                        "grandchild": {
                            "type": "string",
                            "description": "Deeply nested description that should be stripped.",
                        },
                    },
                },
            },
        });
        let result = strip_schema_metadata(&schema, 0);
        assert!(result.get("description").is_some());
        let child = &result["properties"]["child"];
        assert!(child.get("description").is_some());
        assert!(child["properties"]["grandchild"].get("description").is_none());
    }

    #[test]
    fn strip_preserves_items_and_union_schemas() {
        let schema = json!({
            "type": "array",
            "items": {
                "type": "object",
                "required": ["id"],
                "properties": {"tags": {"type": "array", "items": {"type": "string"}}},
            },
        });
        let result = strip_schema_metadata(&schema, 0);
        assert_eq!(result["items"]["required"], json!(["id"]));
        assert_eq!(result["items"]["properties"]["tags"]["items"]["type"], json!("string"));

        let union = json!({"anyOf": [{"enum": ["a", "b"]}, {"properties": {"x": {"type": "integer"}}}]});
        let result = strip_schema_metadata(&union, 0);
        assert_eq!(result["anyOf"].as_array().unwrap().len(), 2);
        assert_eq!(result["anyOf"][0]["enum"], json!(["a", "b"]));
        assert_eq!(result["anyOf"][1]["properties"]["x"]["type"], json!("integer"));
    }

    #[test]
    fn search_result_ranks_matches_and_reports_count() {
        let mut state = ProxyState::new(16);
        state.set_tools(&[
            json!({
                "name": "list_pull_requests",
                "description": "List pull requests for a repo",
                "inputSchema": {"type": "object", "properties": {"repo": {"type": "string"}}},
            }),
            json!({
                "name": "create_issue",
                "description": "Create an issue",
                "inputSchema": {"type": "object", "properties": {"title": {"type": "string"}}},
            }),
        ]);
        let cfg = ProxyConfig {
            lazy_fallback_full_on_low_confidence: false,
            ..lazy_cfg(LazyMode::Minimal)
        };
        let result = build_search_result(&state, &cfg, &json!({"query": "pull requests"}));
        let payload = &result["structuredContent"];
        assert_eq!(payload["matches"][0]["name"], json!("list_pull_requests"));
        assert_eq!(payload["count"], json!(1));
        assert!(payload.get("tools").is_none());
        // The text item mirrors the structured payload.
        let text = result["content"][0]["text"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(text).unwrap();
        assert_eq!(&parsed, payload);
    }

    #[test]
    fn low_confidence_search_falls_back_to_full_catalog() {
        let mut state = ProxyState::new(16);
        state.set_tools(&[json!({"name": "alpha", "description": "first tool"})]);
        let cfg = lazy_cfg(LazyMode::Minimal);
        let result = build_search_result(&state, &cfg, &json!({"query": "nothing relevant"}));
        let payload = &result["structuredContent"];
        assert_eq!(payload["fallback"], json!("full_tools_due_low_confidence"));
        assert_eq!(payload["tools"].as_array().unwrap().len(), 1);
    }
}
