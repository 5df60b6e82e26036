//! Cache-key construction and the mutating-tool-name heuristic.

use crate::json::stable_hash;
use serde_json::{json, Value};

/// Verbs whose presence in a tool name marks it as state-changing.
///
/// Includes stateful browser/session operations that can invalidate
/// previously cached reads even though they are not writes in the
/// storage sense. Matched as substrings of the lowercased name.
const MUTATING_VERBS: &[&str] = &[
    "create", "update", "delete", "remove", "set", "write", "insert", "patch", "post", "put",
    "merge", "upload", "commit", "navigate", "open", "close", "click", "type", "press", "select",
    "hover", "drag", "drop", "scroll", "evaluate", "execute", "goto", "reload", "back", "forward",
];

/// Returns true when `tool_name` looks like a state-changing operation.
pub fn is_mutating_tool_name(tool_name: &str) -> bool {
    let name = tool_name.to_lowercase();
    MUTATING_VERBS.iter().any(|verb| name.contains(verb))
}

/// Stable hash of a tool-call argument object; `None` hashes like `{}`.
pub fn args_hash(arguments: Option<&Value>) -> String {
    match arguments {
        Some(value) => stable_hash(value),
        None => stable_hash(&json!({})),
    }
}

/// Builds the cache/history key for one tool invocation.
pub fn make_cache_key(
    session_id: &str,
    server_name: &str,
    tool_name: &str,
    arguments: Option<&Value>,
) -> String {
    format!("{session_id}:{server_name}:{tool_name}:{}", args_hash(arguments))
}
