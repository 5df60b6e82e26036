//! Runtime counters and the exit summary.

use serde_json::{json, Value};

/// Counters covering every optimization vector plus raw upstream traffic.
#[derive(Debug, Default, Clone)]
pub struct ProxyMetrics {
    pub tools_list_requests: u64,
    pub tools_list_saved_bytes: u64,
    pub tools_hash_sync_hits: u64,
    pub tools_hash_sync_misses: u64,
    pub tools_hash_sync_not_modified: u64,
    pub tools_hash_sync_saved_bytes: u64,
    pub tools_hash_sync_saved_tokens: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub result_compressions: u64,
    pub result_saved_bytes: u64,
    pub delta_responses: u64,
    pub delta_saved_bytes: u64,
    pub search_calls: u64,
    pub upstream_requests: u64,
    pub upstream_request_bytes: u64,
    pub upstream_request_tokens: u64,
    pub upstream_responses: u64,
    pub upstream_response_bytes: u64,
    pub upstream_response_tokens: u64,
}

impl ProxyMetrics {
    /// Snapshot attached under `_ultra_lean_mcp_proxy.runtime_metrics`
    /// when `--stats` is on.
    pub fn runtime_snapshot(&self) -> Value {
        json!({
            "upstream_requests": self.upstream_requests,
            "upstream_request_tokens": self.upstream_request_tokens,
            "upstream_request_bytes": self.upstream_request_bytes,
            "upstream_responses": self.upstream_responses,
            "upstream_response_tokens": self.upstream_response_tokens,
            "upstream_response_bytes": self.upstream_response_bytes,
        })
    }

    /// Logs the end-of-session summary.
    pub fn log_summary(&self) {
        tracing::info!(
            target: "ulmp::stats",
            tools_list = self.tools_list_requests,
            tools_list_saved_bytes = self.tools_list_saved_bytes,
            hash_sync_hits = self.tools_hash_sync_hits,
            hash_sync_misses = self.tools_hash_sync_misses,
            hash_sync_not_modified = self.tools_hash_sync_not_modified,
            hash_sync_saved_bytes = self.tools_hash_sync_saved_bytes,
            hash_sync_saved_tokens = self.tools_hash_sync_saved_tokens,
            cache_hits = self.cache_hits,
            cache_misses = self.cache_misses,
            result_compressions = self.result_compressions,
            result_saved_bytes = self.result_saved_bytes,
            delta_responses = self.delta_responses,
            delta_saved_bytes = self.delta_saved_bytes,
            search_calls = self.search_calls,
            upstream_requests = self.upstream_requests,
            upstream_request_tokens = self.upstream_request_tokens,
            upstream_request_bytes = self.upstream_request_bytes,
            upstream_responses = self.upstream_responses,
            upstream_response_tokens = self.upstream_response_tokens,
            upstream_response_bytes = self.upstream_response_bytes,
            "proxy session summary"
        );
    }
}
