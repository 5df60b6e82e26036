//! Layered configuration resolver for the proxy runtime.
//!
//! Precedence, later sources winning: built-in defaults ← config file ←
//! environment (`ULTRA_LEAN_MCP_PROXY_*`) ← CLI flags. The config file is
//! a JSON document with top-level sections `proxy`, `optimizations`, and
//! `servers`; the active server profile is picked by substring match of
//! `match.command_contains` against the joined upstream command and
//! deep-merged onto the globals.
//!
//! The resolver is fail-closed: an invalid mode, an unsupported hash
//! algorithm, or (with `--strict-config`) an unknown top-level section
//! aborts startup instead of starting a misconfigured relay.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use ulmp_core::CompressionMode;

/// Prefix for every configuration environment variable.
pub const ENV_PREFIX: &str = "ULTRA_LEAN_MCP_PROXY_";

const KNOWN_SECTIONS: &[&str] = &["proxy", "optimizations", "servers"];

/// Lazy tool-visibility mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LazyMode {
    #[default]
    Off,
    Minimal,
    Catalog,
    SearchOnly,
}

impl LazyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Catalog => "catalog",
            Self::SearchOnly => "search_only",
        }
    }
}

impl fmt::Display for LazyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LazyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "minimal" => Ok(Self::Minimal),
            "catalog" => Ok(Self::Catalog),
            "search_only" => Ok(Self::SearchOnly),
            other => Err(format!("invalid lazy mode: {other}")),
        }
    }
}

/// Resolved proxy runtime config after the file/env/CLI merge.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyConfig {
    pub stats: bool,
    pub verbose: bool,
    pub trace_rpc: bool,
    pub session_id: String,
    pub strict_config: bool,

    pub definition_compression_enabled: bool,

    pub result_compression_enabled: bool,
    pub result_compression_mode: CompressionMode,
    pub result_min_payload_bytes: usize,
    pub result_strip_nulls: bool,
    pub result_strip_defaults: bool,
    pub result_min_token_savings_abs: usize,
    pub result_min_token_savings_ratio: f64,
    pub result_min_compressibility: f64,
    pub result_shared_key_registry: bool,
    pub result_key_bootstrap_interval: u64,
    pub result_minify_redundant_text: bool,

    pub delta_responses_enabled: bool,
    pub delta_min_savings_ratio: f64,
    pub delta_max_patch_bytes: usize,
    pub delta_max_patch_ratio: f64,
    pub delta_snapshot_interval: u64,

    pub lazy_loading_enabled: bool,
    pub lazy_mode: LazyMode,
    pub lazy_top_k: usize,
    pub lazy_min_tools: usize,
    pub lazy_min_tokens: usize,
    pub lazy_min_confidence_score: f64,
    pub lazy_fallback_full_on_low_confidence: bool,

    pub tools_hash_sync_enabled: bool,
    pub tools_hash_sync_algorithm: String,
    pub tools_hash_sync_refresh_interval: u64,
    pub tools_hash_sync_include_server_fingerprint: bool,

    pub caching_enabled: bool,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    pub cache_errors: bool,
    pub cache_mutating_tools: bool,
    pub cache_adaptive_ttl: bool,
    pub cache_ttl_min_seconds: u64,
    pub cache_ttl_max_seconds: u64,

    pub auto_disable_enabled: bool,
    pub auto_disable_threshold: u32,
    pub auto_disable_cooldown_requests: u32,

    pub server_name: String,
    /// Per-tool feature overrides from the active server profile.
    pub tool_overrides: Map<String, Value>,
    pub source_path: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            stats: false,
            verbose: false,
            trace_rpc: false,
            session_id: "default".into(),
            strict_config: false,

            definition_compression_enabled: true,

            result_compression_enabled: false,
            result_compression_mode: CompressionMode::Balanced,
            result_min_payload_bytes: 512,
            result_strip_nulls: false,
            result_strip_defaults: false,
            result_min_token_savings_abs: 100,
            result_min_token_savings_ratio: 0.05,
            result_min_compressibility: 0.2,
            result_shared_key_registry: true,
            result_key_bootstrap_interval: 8,
            result_minify_redundant_text: true,

            delta_responses_enabled: false,
            delta_min_savings_ratio: 0.15,
            delta_max_patch_bytes: 65_536,
            delta_max_patch_ratio: 0.8,
            delta_snapshot_interval: 5,

            lazy_loading_enabled: false,
            lazy_mode: LazyMode::Off,
            lazy_top_k: 8,
            lazy_min_tools: 30,
            lazy_min_tokens: 8000,
            lazy_min_confidence_score: 2.0,
            lazy_fallback_full_on_low_confidence: true,

            tools_hash_sync_enabled: false,
            tools_hash_sync_algorithm: "sha256".into(),
            tools_hash_sync_refresh_interval: 50,
            tools_hash_sync_include_server_fingerprint: true,

            caching_enabled: false,
            cache_ttl_seconds: 300,
            cache_max_entries: 5000,
            cache_errors: false,
            cache_mutating_tools: false,
            cache_adaptive_ttl: true,
            cache_ttl_min_seconds: 30,
            cache_ttl_max_seconds: 1800,

            auto_disable_enabled: true,
            auto_disable_threshold: 3,
            auto_disable_cooldown_requests: 20,

            server_name: "default".into(),
            tool_overrides: Map::new(),
            source_path: None,
        }
    }
}

impl ProxyConfig {
    /// Whether `feature_name` is enabled for `tool_name`, honoring the
    /// per-tool override (bare bool or `{enabled: …}` object).
    pub fn feature_enabled_for_tool(
        &self,
        tool_name: Option<&str>,
        feature_name: &str,
        default: bool,
    ) -> bool {
        let Some(tool_name) = tool_name else {
            return default;
        };
        let feature_cfg = self
            .tool_overrides
            .get(tool_name)
            .and_then(Value::as_object)
            .and_then(|tool_cfg| tool_cfg.get(feature_name));
        match feature_cfg {
            Some(Value::Bool(enabled)) => *enabled,
            Some(Value::Object(map)) => map
                .get("enabled")
                .and_then(parse_bool)
                .unwrap_or(default),
            _ => default,
        }
    }

    /// Base cache TTL for a tool, honoring `caching.ttl_seconds` overrides.
    pub fn cache_ttl_for_tool(&self, tool_name: Option<&str>) -> u64 {
        tool_name
            .and_then(|name| self.tool_overrides.get(name))
            .and_then(Value::as_object)
            .and_then(|tool_cfg| tool_cfg.get("caching"))
            .and_then(Value::as_object)
            .and_then(|caching| caching.get("ttl_seconds"))
            .and_then(Value::as_u64)
            .unwrap_or(self.cache_ttl_seconds)
    }

    /// Whether mutating invocations of `tool_name` may be cached. The
    /// per-tool `caching.cache_mutating` override wins over the global.
    pub fn cache_mutating_for_tool(&self, tool_name: &str) -> bool {
        self.tool_overrides
            .get(tool_name)
            .and_then(Value::as_object)
            .and_then(|tool_cfg| tool_cfg.get("caching"))
            .and_then(Value::as_object)
            .and_then(|caching| caching.get("cache_mutating"))
            .and_then(parse_bool)
            .unwrap_or(self.cache_mutating_tools)
    }
}

/// CLI-sourced overrides, applied last.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub stats: Option<bool>,
    pub verbose: Option<bool>,
    pub trace_rpc: Option<bool>,
    pub session_id: Option<String>,
    pub strict_config: Option<bool>,
    pub result_compression: Option<bool>,
    pub delta_responses: Option<bool>,
    pub lazy_loading: Option<bool>,
    pub tools_hash_sync: Option<bool>,
    pub caching: Option<bool>,
    pub cache_ttl: Option<u64>,
    pub delta_min_savings: Option<f64>,
    pub lazy_mode: Option<LazyMode>,
    pub tools_hash_refresh_interval: Option<u64>,
    pub search_top_k: Option<usize>,
    pub result_compression_mode: Option<CompressionMode>,
    pub config_path: Option<PathBuf>,
}

/// Liberal boolean parsing shared by config values and env vars.
fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => parse_bool_str(s),
        _ => None,
    }
}

fn parse_bool_str(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Key-wise recursive merge: objects merge, everything else replaces.
fn deep_merge(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        match (merged.get(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merged.insert(key.clone(), Value::Object(deep_merge(existing, incoming)));
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

fn read_config_file(path: &Path) -> Result<Map<String, Value>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read proxy config {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse proxy config {}", path.display()))?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => bail!("proxy config must be a JSON object: {}", path.display()),
    }
}

fn section<'a>(data: &'a Map<String, Value>, name: &str) -> Option<&'a Map<String, Value>> {
    data.get(name).and_then(Value::as_object)
}

fn get_bool(map: &Map<String, Value>, key: &str) -> Option<bool> {
    map.get(key).and_then(parse_bool)
}

fn get_u64(map: &Map<String, Value>, key: &str) -> Option<u64> {
    map.get(key).and_then(Value::as_u64)
}

fn get_f64(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}

fn get_str<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

fn ratio(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Picks the active server profile: the `default` profile, deep-merged
/// with the first non-default profile whose `match.command_contains`
/// substring appears in the joined upstream command.
fn extract_server_profile(
    config_data: &Map<String, Value>,
    upstream_command: &[String],
) -> (String, Map<String, Value>) {
    let Some(servers) = section(config_data, "servers") else {
        return ("default".into(), Map::new());
    };

    let command_text = upstream_command.join(" ");
    let mut selected_name = String::from("default");
    let mut selected_profile = servers
        .get("default")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for (server_name, profile) in servers {
        if server_name == "default" {
            continue;
        }
        let Some(profile) = profile.as_object() else {
            continue;
        };
        let matches = profile
            .get("match")
            .and_then(Value::as_object)
            .and_then(|m| m.get("command_contains"))
            .and_then(Value::as_str)
            .is_some_and(|needle| command_text.contains(needle));
        if matches {
            selected_name = server_name.clone();
            selected_profile = deep_merge(&selected_profile, profile);
            break;
        }
    }
    (selected_name, selected_profile)
}

fn apply_global_config(
    cfg: &mut ProxyConfig,
    config_data: &Map<String, Value>,
    upstream_command: &[String],
    apply_server_profiles: bool,
) -> Result<()> {
    if let Some(proxy) = section(config_data, "proxy") {
        if let Some(v) = get_bool(proxy, "stats") {
            cfg.stats = v;
        }
        if let Some(v) = get_bool(proxy, "verbose") {
            cfg.verbose = v;
        }
        if let Some(v) = get_str(proxy, "session_id") {
            if !v.is_empty() {
                cfg.session_id = v.to_string();
            }
        }
        if let Some(v) = get_u64(proxy, "max_sessions") {
            if v > 0 {
                cfg.cache_max_entries = (v as usize).saturating_mul(10);
            }
        }
        if let Some(Value::Bool(v)) = proxy.get("strict_config") {
            cfg.strict_config = *v;
        }
    }

    if let Some(optimizations) = section(config_data, "optimizations") {
        if let Some(def_cfg) = optimizations.get("definition_compression").and_then(Value::as_object) {
            if let Some(v) = get_bool(def_cfg, "enabled") {
                cfg.definition_compression_enabled = v;
            }
        }

        if let Some(rcfg) = optimizations.get("result_compression").and_then(Value::as_object) {
            if let Some(v) = get_bool(rcfg, "enabled") {
                cfg.result_compression_enabled = v;
            }
            if let Some(v) = get_str(rcfg, "mode") {
                cfg.result_compression_mode = v
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?;
            }
            if let Some(v) = get_u64(rcfg, "min_payload_bytes") {
                cfg.result_min_payload_bytes = v as usize;
            }
            if let Some(v) = get_u64(rcfg, "min_token_savings_abs") {
                cfg.result_min_token_savings_abs = v as usize;
            }
            if let Some(v) = get_f64(rcfg, "min_token_savings_ratio") {
                cfg.result_min_token_savings_ratio = ratio(v);
            }
            if let Some(v) = get_f64(rcfg, "min_compressibility") {
                cfg.result_min_compressibility = ratio(v);
            }
            if let Some(v) = get_bool(rcfg, "shared_key_registry") {
                cfg.result_shared_key_registry = v;
            }
            if let Some(v) = get_u64(rcfg, "key_bootstrap_interval") {
                cfg.result_key_bootstrap_interval = v;
            }
            if let Some(v) = get_bool(rcfg, "minify_redundant_text") {
                cfg.result_minify_redundant_text = v;
            }
            if let Some(v) = get_bool(rcfg, "strip_nulls") {
                cfg.result_strip_nulls = v;
            }
            if let Some(v) = get_bool(rcfg, "strip_defaults") {
                cfg.result_strip_defaults = v;
            }
        }

        if let Some(dcfg) = optimizations.get("delta_responses").and_then(Value::as_object) {
            if let Some(v) = get_bool(dcfg, "enabled") {
                cfg.delta_responses_enabled = v;
            }
            if let Some(v) = get_f64(dcfg, "min_savings_ratio") {
                cfg.delta_min_savings_ratio = ratio(v);
            }
            if let Some(v) = get_u64(dcfg, "max_patch_bytes") {
                cfg.delta_max_patch_bytes = v as usize;
            }
            if let Some(v) = get_f64(dcfg, "max_patch_ratio") {
                cfg.delta_max_patch_ratio = ratio(v);
            }
            if let Some(v) = get_u64(dcfg, "snapshot_interval") {
                cfg.delta_snapshot_interval = v.max(1);
            }
        }

        if let Some(lcfg) = optimizations.get("lazy_loading").and_then(Value::as_object) {
            if let Some(v) = get_bool(lcfg, "enabled") {
                cfg.lazy_loading_enabled = v;
            }
            if let Some(v) = get_str(lcfg, "mode") {
                cfg.lazy_mode = v.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            }
            if let Some(v) = get_u64(lcfg, "top_k") {
                cfg.lazy_top_k = (v as usize).max(1);
            }
            if let Some(v) = get_u64(lcfg, "min_tools") {
                cfg.lazy_min_tools = v as usize;
            }
            if let Some(v) = get_u64(lcfg, "min_tokens") {
                cfg.lazy_min_tokens = v as usize;
            }
            if let Some(v) = get_f64(lcfg, "min_confidence_score") {
                cfg.lazy_min_confidence_score = v;
            }
            if let Some(v) = get_bool(lcfg, "fallback_full_on_low_confidence") {
                cfg.lazy_fallback_full_on_low_confidence = v;
            }
        }

        if let Some(hcfg) = optimizations.get("tools_hash_sync").and_then(Value::as_object) {
            if let Some(v) = get_bool(hcfg, "enabled") {
                cfg.tools_hash_sync_enabled = v;
            }
            if let Some(v) = get_str(hcfg, "algorithm") {
                cfg.tools_hash_sync_algorithm = v.trim().to_lowercase();
            }
            if let Some(v) = get_u64(hcfg, "refresh_interval") {
                cfg.tools_hash_sync_refresh_interval = v.max(1);
            }
            if let Some(v) = get_bool(hcfg, "include_server_fingerprint") {
                cfg.tools_hash_sync_include_server_fingerprint = v;
            }
        }

        if let Some(ccfg) = optimizations.get("caching").and_then(Value::as_object) {
            if let Some(v) = get_bool(ccfg, "enabled") {
                cfg.caching_enabled = v;
            }
            if let Some(v) = get_u64(ccfg, "default_ttl_seconds") {
                cfg.cache_ttl_seconds = v;
            }
            if let Some(v) = get_u64(ccfg, "max_entries") {
                cfg.cache_max_entries = (v as usize).max(1);
            }
            if let Some(v) = get_bool(ccfg, "cache_errors") {
                cfg.cache_errors = v;
            }
            if let Some(v) = get_bool(ccfg, "cache_mutating_tools") {
                cfg.cache_mutating_tools = v;
            }
            if let Some(v) = get_bool(ccfg, "adaptive_ttl") {
                cfg.cache_adaptive_ttl = v;
            }
            if let Some(v) = get_u64(ccfg, "ttl_min_seconds") {
                cfg.cache_ttl_min_seconds = v;
            }
            if let Some(v) = get_u64(ccfg, "ttl_max_seconds") {
                cfg.cache_ttl_max_seconds = v;
            }
        }

        if let Some(acfg) = optimizations.get("auto_disable").and_then(Value::as_object) {
            if let Some(v) = get_bool(acfg, "enabled") {
                cfg.auto_disable_enabled = v;
            }
            if let Some(v) = get_u64(acfg, "threshold") {
                cfg.auto_disable_threshold = (v as u32).max(1);
            }
            if let Some(v) = get_u64(acfg, "cooldown_requests") {
                cfg.auto_disable_cooldown_requests = (v as u32).max(1);
            }
        }
    }

    if apply_server_profiles {
        let (server_name, profile) = extract_server_profile(config_data, upstream_command);
        cfg.server_name = server_name;
        if !profile.is_empty() {
            let mut profile_opts = Map::new();
            if let Some(proxy) = profile.get("proxy").filter(|v| v.is_object()) {
                profile_opts.insert("proxy".into(), proxy.clone());
            }
            if let Some(opts) = profile.get("optimizations").filter(|v| v.is_object()) {
                profile_opts.insert("optimizations".into(), opts.clone());
            }
            if !profile_opts.is_empty() {
                apply_global_config(cfg, &profile_opts, upstream_command, false)?;
            }
            if let Some(tools) = profile.get("tools").and_then(Value::as_object) {
                cfg.tool_overrides = deep_merge(&cfg.tool_overrides, tools);
            }
        }
    }

    Ok(())
}

fn apply_env(cfg: &mut ProxyConfig, env: &HashMap<String, String>) -> Result<()> {
    let var = |name: &str| env.get(&format!("{ENV_PREFIX}{name}"));
    let env_bool = |name: &str| var(name).and_then(|v| parse_bool_str(v));
    let env_u64 = |name: &str| var(name).and_then(|v| v.parse::<u64>().ok());
    let env_f64 = |name: &str| var(name).and_then(|v| v.parse::<f64>().ok());

    if let Some(v) = env_bool("STATS") {
        cfg.stats = v;
    }
    if let Some(v) = env_bool("VERBOSE") {
        cfg.verbose = v;
    }
    if let Some(v) = var("SESSION_ID") {
        if !v.is_empty() {
            cfg.session_id = v.clone();
        }
    }

    if let Some(v) = env_bool("RESULT_COMPRESSION") {
        cfg.result_compression_enabled = v;
    }
    if let Some(v) = var("RESULT_COMPRESSION_MODE") {
        cfg.result_compression_mode = v.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    }
    if let Some(v) = env_u64("RESULT_MIN_TOKEN_SAVINGS_ABS") {
        cfg.result_min_token_savings_abs = v as usize;
    }
    if let Some(v) = env_f64("RESULT_MIN_TOKEN_SAVINGS_RATIO") {
        cfg.result_min_token_savings_ratio = ratio(v);
    }
    if let Some(v) = env_bool("RESULT_SHARED_KEY_REGISTRY") {
        cfg.result_shared_key_registry = v;
    }
    if let Some(v) = env_u64("RESULT_KEY_BOOTSTRAP_INTERVAL") {
        cfg.result_key_bootstrap_interval = v;
    }
    if let Some(v) = env_bool("RESULT_MINIFY_REDUNDANT_TEXT") {
        cfg.result_minify_redundant_text = v;
    }

    if let Some(v) = env_bool("DELTA_RESPONSES") {
        cfg.delta_responses_enabled = v;
    }
    if let Some(v) = env_f64("DELTA_MIN_SAVINGS") {
        cfg.delta_min_savings_ratio = ratio(v);
    }
    if let Some(v) = env_f64("DELTA_MAX_PATCH_RATIO") {
        cfg.delta_max_patch_ratio = ratio(v);
    }

    if let Some(v) = env_bool("LAZY_LOADING") {
        cfg.lazy_loading_enabled = v;
    }
    if let Some(v) = var("LAZY_MODE") {
        cfg.lazy_mode = v.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    }
    if let Some(v) = env_u64("SEARCH_TOP_K") {
        cfg.lazy_top_k = (v as usize).max(1);
    }
    if let Some(v) = env_u64("LAZY_MIN_TOOLS") {
        cfg.lazy_min_tools = v as usize;
    }
    if let Some(v) = env_u64("LAZY_MIN_TOKENS") {
        cfg.lazy_min_tokens = v as usize;
    }
    if let Some(v) = env_f64("LAZY_MIN_CONFIDENCE") {
        cfg.lazy_min_confidence_score = v;
    }

    if let Some(v) = env_bool("TOOLS_HASH_SYNC") {
        cfg.tools_hash_sync_enabled = v;
    }
    if let Some(v) = env_u64("TOOLS_HASH_REFRESH_INTERVAL") {
        cfg.tools_hash_sync_refresh_interval = v.max(1);
    }

    if let Some(v) = env_bool("CACHING") {
        cfg.caching_enabled = v;
    }
    if let Some(v) = env_u64("CACHE_TTL_SECONDS") {
        cfg.cache_ttl_seconds = v;
    }
    if let Some(v) = env_bool("CACHE_ADAPTIVE_TTL") {
        cfg.cache_adaptive_ttl = v;
    }
    Ok(())
}

fn apply_cli_overrides(cfg: &mut ProxyConfig, cli: &CliOverrides) {
    if let Some(v) = cli.stats {
        cfg.stats = v;
    }
    if let Some(v) = cli.verbose {
        cfg.verbose = v;
    }
    if let Some(v) = cli.trace_rpc {
        cfg.trace_rpc = v;
    }
    if let Some(v) = cli.result_compression {
        cfg.result_compression_enabled = v;
    }
    if let Some(v) = cli.delta_responses {
        cfg.delta_responses_enabled = v;
    }
    if let Some(v) = cli.lazy_loading {
        cfg.lazy_loading_enabled = v;
    }
    if let Some(v) = cli.tools_hash_sync {
        cfg.tools_hash_sync_enabled = v;
    }
    if let Some(v) = cli.caching {
        cfg.caching_enabled = v;
    }
    if let Some(session_id) = &cli.session_id {
        if !session_id.is_empty() {
            cfg.session_id = session_id.clone();
        }
    }
    if let Some(v) = cli.strict_config {
        cfg.strict_config = v;
    }
    if let Some(v) = cli.cache_ttl {
        cfg.cache_ttl_seconds = v;
    }
    if let Some(v) = cli.delta_min_savings {
        cfg.delta_min_savings_ratio = ratio(v);
    }
    if let Some(v) = cli.lazy_mode {
        cfg.lazy_mode = v;
    }
    if let Some(v) = cli.search_top_k {
        cfg.lazy_top_k = v.max(1);
    }
    if let Some(v) = cli.result_compression_mode {
        cfg.result_compression_mode = v;
    }
    if let Some(v) = cli.tools_hash_refresh_interval {
        cfg.tools_hash_sync_refresh_interval = v.max(1);
    }
}

/// Resolves the proxy config from defaults + file + env + CLI.
pub fn load_proxy_config(
    upstream_command: &[String],
    config_path: Option<&Path>,
    cli: &CliOverrides,
    env: &HashMap<String, String>,
) -> Result<ProxyConfig> {
    let mut cfg = ProxyConfig::default();

    let resolved_path: Option<PathBuf> = config_path
        .map(Path::to_path_buf)
        .or_else(|| cli.config_path.clone())
        .or_else(|| env.get(&format!("{ENV_PREFIX}CONFIG")).map(PathBuf::from));

    let mut unknown_sections: Vec<String> = Vec::new();
    if let Some(path) = &resolved_path {
        let config_data = read_config_file(path)?;
        unknown_sections = config_data
            .keys()
            .filter(|key| !KNOWN_SECTIONS.contains(&key.as_str()))
            .cloned()
            .collect();
        apply_global_config(&mut cfg, &config_data, upstream_command, true)?;
        cfg.source_path = Some(path.clone());
    }

    apply_env(&mut cfg, env)?;
    apply_cli_overrides(&mut cfg, cli);

    if cfg.strict_config && !unknown_sections.is_empty() {
        bail!(
            "unknown top-level config sections: {}",
            unknown_sections.join(", ")
        );
    }
    if cfg.tools_hash_sync_algorithm != "sha256" {
        bail!(
            "invalid tools hash sync algorithm: {}",
            cfg.tools_hash_sync_algorithm
        );
    }
    if cfg.cache_ttl_max_seconds < cfg.cache_ttl_min_seconds {
        cfg.cache_ttl_max_seconds = cfg.cache_ttl_min_seconds;
    }

    // Convenience: a lazy mode implies lazy loading.
    if cfg.lazy_mode != LazyMode::Off {
        cfg.lazy_loading_enabled = true;
    }
    // Off mode wins over the enable flag.
    if cfg.result_compression_mode == CompressionMode::Off {
        cfg.result_compression_enabled = false;
    }

    Ok(cfg)
}
