//! In-memory state for one proxy process.
//!
//! Holds the response cache, the delta history, the current tool catalog
//! (with the local search index used by the lazy-loading meta-tool), and
//! tools-hash bookkeeping per scope. Nothing here touches the disk or
//! the network; everything dies with the process.
//!
//! # Concurrency Model
//!
//! The state is designed to be shared via `Arc<Mutex<ProxyState>>`. A
//! single coarse mutex is used because both relay directions mutate
//! mostly disjoint slices of state and every operation is a fast in-memory
//! lookup, so lock contention is negligible. Reads clone stored values so
//! callers never alias interior state.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

/// One cached tool-call result.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created_at: Instant,
    expires_at: Instant,
    hits: u64,
}

/// Tools-hash bookkeeping for one `session:server:profile` scope.
#[derive(Debug, Clone)]
pub struct ToolsHashEntry {
    pub last_hash: Option<String>,
    pub conditional_hits: u64,
    pub updated_at: Option<Instant>,
}

impl ToolsHashEntry {
    fn new() -> Self {
        Self {
            last_hash: None,
            conditional_hits: 0,
            updated_at: None,
        }
    }
}

static QUERY_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z0-9_]+").expect("QUERY_TOKEN: compile-time constant"));

/// In-memory state for one proxy session.
pub struct ProxyState {
    max_cache_entries: usize,
    cache: HashMap<String, CacheEntry>,
    history: HashMap<String, Value>,
    history_order: VecDeque<String>,
    tools: Vec<Value>,
    tools_hash: HashMap<String, ToolsHashEntry>,
}

impl ProxyState {
    pub fn new(max_cache_entries: usize) -> Self {
        Self {
            max_cache_entries: max_cache_entries.max(1),
            cache: HashMap::new(),
            history: HashMap::new(),
            history_order: VecDeque::new(),
            tools: Vec::new(),
            tools_hash: HashMap::new(),
        }
    }

    // Cache

    /// Looks up a cached value, evicting it when the TTL has lapsed.
    /// Returns a clone so callers cannot alias the stored value.
    pub fn cache_get(&mut self, key: &str) -> Option<Value> {
        let expired = match self.cache.get(key) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            self.cache.remove(key);
            return None;
        }
        let entry = self.cache.get_mut(key)?;
        entry.hits += 1;
        Some(entry.value.clone())
    }

    pub fn cache_set(&mut self, key: &str, value: &Value, ttl: Duration) {
        let now = Instant::now();
        self.cache.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                created_at: now,
                expires_at: now + ttl,
                hits: 0,
            },
        );
        self.evict_cache_if_needed();
    }

    /// Removes every cache entry whose key starts with `prefix`.
    pub fn cache_invalidate_prefix(&mut self, prefix: &str) -> usize {
        let before = self.cache.len();
        self.cache.retain(|key, _| !key.starts_with(prefix));
        before - self.cache.len()
    }

    /// Evicts lowest-hit, then oldest entries until under the limit.
    fn evict_cache_if_needed(&mut self) {
        if self.cache.len() <= self.max_cache_entries {
            return;
        }
        let mut ordered: Vec<(String, u64, Instant)> = self
            .cache
            .iter()
            .map(|(key, entry)| (key.clone(), entry.hits, entry.created_at))
            .collect();
        ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.2.cmp(&b.2)));
        let overflow = self.cache.len() - self.max_cache_entries;
        for (key, _, _) in ordered.into_iter().take(overflow) {
            self.cache.remove(&key);
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    // Delta history

    pub fn history_get(&self, key: &str) -> Option<Value> {
        self.history.get(key).cloned()
    }

    pub fn history_set(&mut self, key: &str, value: &Value) {
        if !self.history.contains_key(key) {
            self.history_order.push_back(key.to_string());
        }
        self.history.insert(key.to_string(), value.clone());
        // Soft bound: drop the oldest inserted entry.
        while self.history.len() > self.max_cache_entries * 2 {
            match self.history_order.pop_front() {
                Some(oldest) => {
                    if self.history.remove(&oldest).is_none() {
                        continue;
                    }
                }
                None => break,
            }
        }
    }

    pub fn history_invalidate_prefix(&mut self, prefix: &str) -> usize {
        let before = self.history.len();
        self.history.retain(|key, _| !key.starts_with(prefix));
        before - self.history.len()
    }

    // Tools index

    /// Replaces the catalog wholesale with the latest `tools/list` view.
    pub fn set_tools(&mut self, tools: &[Value]) {
        self.tools = tools.to_vec();
    }

    pub fn tools(&self) -> Vec<Value> {
        self.tools.clone()
    }

    pub fn tools_len(&self) -> usize {
        self.tools.len()
    }

    /// Scores the catalog against `query` and returns the top matches,
    /// highest score first.
    ///
    /// Additive scoring, case-insensitive: whole-query substring in the
    /// name +4; per query token: name +2, description +1, property names
    /// +1.25, combined haystack +0.2. Zero-score tools drop out; when
    /// nothing matches at all, every tool is returned at a floor score so
    /// the caller can still surface candidates.
    pub fn search_tools(&self, query: &str, top_k: usize, include_schemas: bool) -> Vec<Value> {
        if self.tools.is_empty() {
            return Vec::new();
        }

        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = QUERY_TOKEN
            .find_iter(&query_lower)
            .map(|m| m.as_str())
            .collect();

        let mut ranked: Vec<(f64, &Value)> = Vec::new();
        for tool in &self.tools {
            let name = tool.get("name").and_then(Value::as_str).unwrap_or("").to_lowercase();
            let desc = tool
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            let param_text = tool_schema(tool)
                .and_then(|schema| schema.get("properties"))
                .and_then(Value::as_object)
                .map(|props| props.keys().cloned().collect::<Vec<_>>().join(" ").to_lowercase())
                .unwrap_or_default();
            let haystack = format!("{name} {desc} {param_text}");

            let mut score = 0.0;
            if !query_lower.is_empty() && name.contains(&query_lower) {
                score += 4.0;
            }
            for term in &terms {
                if name.contains(term) {
                    score += 2.0;
                }
                if desc.contains(term) {
                    score += 1.0;
                }
                if param_text.contains(term) {
                    score += 1.25;
                }
                if haystack.contains(term) {
                    score += 0.2;
                }
            }
            if score > 0.0 {
                ranked.push((score, tool));
            }
        }

        if ranked.is_empty() {
            ranked = self.tools.iter().map(|tool| (0.01, tool)).collect();
        }

        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked
            .into_iter()
            .take(top_k.max(1))
            .map(|(score, tool)| {
                let mut item = Map::new();
                item.insert("name".into(), tool.get("name").cloned().unwrap_or(Value::Null));
                item.insert("score".into(), json!((score * 1000.0).round() / 1000.0));
                item.insert(
                    "description".into(),
                    tool.get("description").cloned().unwrap_or_else(|| json!("")),
                );
                if include_schemas {
                    if let Some(schema) = tool_schema(tool) {
                        item.insert("inputSchema".into(), schema.clone());
                    }
                }
                Value::Object(item)
            })
            .collect()
    }

    // Tools-hash scope state

    pub fn tools_hash_get(&self, key: &str) -> Option<ToolsHashEntry> {
        self.tools_hash.get(key).cloned()
    }

    /// Stores the latest hash for a scope; a changed hash resets the
    /// conditional-hit counter.
    pub fn tools_hash_set_last(&mut self, key: &str, tools_hash: &str) {
        let entry = self
            .tools_hash
            .entry(key.to_string())
            .or_insert_with(ToolsHashEntry::new);
        if entry.last_hash.as_deref() != Some(tools_hash) {
            entry.conditional_hits = 0;
        }
        entry.last_hash = Some(tools_hash.to_string());
        entry.updated_at = Some(Instant::now());
    }

    /// Increments and returns the scope's conditional-hit counter.
    pub fn tools_hash_record_hit(&mut self, key: &str) -> u64 {
        let entry = self
            .tools_hash
            .entry(key.to_string())
            .or_insert_with(ToolsHashEntry::new);
        entry.conditional_hits += 1;
        entry.updated_at = Some(Instant::now());
        entry.conditional_hits
    }

    pub fn tools_hash_reset_hits(&mut self, key: &str) {
        let entry = self
            .tools_hash
            .entry(key.to_string())
            .or_insert_with(ToolsHashEntry::new);
        entry.conditional_hits = 0;
        entry.updated_at = Some(Instant::now());
    }
}

/// The tool's input schema under either wire spelling.
fn tool_schema(tool: &Value) -> Option<&Value> {
    tool.get("inputSchema").or_else(|| tool.get("input_schema"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulmp_core::make_cache_key;

    #[test]
    fn cache_entries_expire_after_ttl() {
        let mut state = ProxyState::new(10);
        let key = make_cache_key("s1", "srv", "list_items", Some(&json!({"page": 1})));
        state.cache_set(&key, &json!({"ok": true}), Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(10));
        assert!(state.cache_get(&key).is_none());
    }

    #[test]
    fn cache_returns_cloned_values() {
        let mut state = ProxyState::new(10);
        let key = make_cache_key("s1", "srv", "list_items", Some(&json!({"page": 1})));
        state.cache_set(&key, &json!({"nested": {"value": 1}}), Duration::from_secs(60));
        let mut cached = state.cache_get(&key).expect("hit");
        cached["nested"]["value"] = json!(999);
        let cached_again = state.cache_get(&key).expect("hit");
        assert_eq!(cached_again["nested"]["value"], json!(1));
    }

    #[test]
    fn cache_invalidate_prefix_removes_scope_only() {
        let mut state = ProxyState::new(10);
        let k1 = make_cache_key("s1", "srv", "list_items", Some(&json!({"page": 1})));
        let k2 = make_cache_key("s1", "srv", "read_item", Some(&json!({"id": "a"})));
        let k3 = make_cache_key("s2", "srv", "list_items", Some(&json!({"page": 1})));
        state.cache_set(&k1, &json!({"ok": 1}), Duration::from_secs(60));
        state.cache_set(&k2, &json!({"ok": 2}), Duration::from_secs(60));
        state.cache_set(&k3, &json!({"ok": 3}), Duration::from_secs(60));

        assert_eq!(state.cache_invalidate_prefix("s1:srv:"), 2);
        assert!(state.cache_get(&k1).is_none());
        assert!(state.cache_get(&k2).is_none());
        assert_eq!(state.cache_get(&k3), Some(json!({"ok": 3})));
    }

    #[test]
    fn cache_evicts_lowest_hit_then_oldest() {
        let mut state = ProxyState::new(2);
        state.cache_set("a", &json!(1), Duration::from_secs(60));
        state.cache_set("b", &json!(2), Duration::from_secs(60));
        // Touch "a" so "b" is the coldest entry when "c" overflows.
        let _ = state.cache_get("a");
        state.cache_set("c", &json!(3), Duration::from_secs(60));

        assert_eq!(state.cache_len(), 2);
        assert!(state.cache_get("b").is_none());
        assert!(state.cache_get("a").is_some());
        assert!(state.cache_get("c").is_some());
    }

    #[test]
    fn history_invalidate_prefix_removes_scope_only() {
        let mut state = ProxyState::new(10);
        state.history_set("cache_raw:s1:srv:key1", &json!({"a": 1}));
        state.history_set("cache_raw:s1:srv:key2", &json!({"a": 2}));
        state.history_set("cache_raw:s2:srv:key3", &json!({"a": 3}));

        assert_eq!(state.history_invalidate_prefix("cache_raw:s1:srv:"), 2);
        assert!(state.history_get("cache_raw:s1:srv:key1").is_none());
        assert!(state.history_get("cache_raw:s1:srv:key2").is_none());
        assert_eq!(state.history_get("cache_raw:s2:srv:key3"), Some(json!({"a": 3})));
    }

    #[test]
    fn history_overflow_drops_oldest_insertion() {
        let mut state = ProxyState::new(1);
        state.history_set("first", &json!(1));
        state.history_set("second", &json!(2));
        state.history_set("third", &json!(3));
        assert!(state.history_get("first").is_none());
        assert_eq!(state.history_get("second"), Some(json!(2)));
        assert_eq!(state.history_get("third"), Some(json!(3)));
    }

    #[test]
    fn search_returns_ranked_matches() {
        let mut state = ProxyState::new(10);
        state.set_tools(&[
            json!({
                "name": "list_pull_requests",
                "description": "List pull requests for repo",
                "inputSchema": {"type": "object", "properties": {"repo": {"type": "string"}}},
            }),
            json!({
                "name": "create_issue",
                "description": "Create an issue in repository",
                "inputSchema": {"type": "object", "properties": {"title": {"type": "string"}}},
            }),
        ]);
        let matches = state.search_tools("pull requests", 2, false);
        assert!(!matches.is_empty());
        assert_eq!(matches[0]["name"], json!("list_pull_requests"));
        assert!(matches[0].get("inputSchema").is_none());
    }

    #[test]
    fn search_falls_back_to_floor_scores_when_nothing_matches() {
        let mut state = ProxyState::new(10);
        state.set_tools(&[json!({"name": "alpha", "description": "first"})]);
        let matches = state.search_tools("zzz_no_match", 5, false);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["score"], json!(0.01));
    }

    #[test]
    fn tools_hash_scope_tracks_hash_and_hits() {
        let mut state = ProxyState::new(10);
        let key = "session:server:profile";

        assert!(state.tools_hash_get(key).is_none());

        state.tools_hash_set_last(key, "sha256:abc");
        let entry = state.tools_hash_get(key).expect("entry");
        assert_eq!(entry.last_hash.as_deref(), Some("sha256:abc"));
        assert_eq!(entry.conditional_hits, 0);

        assert_eq!(state.tools_hash_record_hit(key), 1);
        assert_eq!(state.tools_hash_record_hit(key), 2);

        // A changed hash resets the counter.
        state.tools_hash_set_last(key, "sha256:def");
        let entry = state.tools_hash_get(key).expect("entry");
        assert_eq!(entry.last_hash.as_deref(), Some("sha256:def"));
        assert_eq!(entry.conditional_hits, 0);
    }
}
