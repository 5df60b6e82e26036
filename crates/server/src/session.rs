//! Per-process session wiring shared by both relay directions.
//!
//! One `ProxySession` exists per proxy process. It bundles the state
//! store, metrics, feature-health ledger, delta counters, and the
//! pending-request map, and is shared behind a single
//! `Arc<parking_lot::Mutex<…>>`; neither relay direction holds the lock
//! across an await point.

use crate::health::HealthTracker;
use crate::metrics::ProxyMetrics;
use serde_json::Value;
use std::collections::HashMap;
use ulmp_core::{KeyDictionaryRegistry, TokenCounter};
use ulmp_state::ProxyState;

/// Per-request metadata recorded when a client request passes through,
/// consumed when the matching upstream response is observed.
#[derive(Debug, Default, Clone)]
pub struct PendingRequest {
    pub method: String,
    pub tool_name: Option<String>,
    pub arguments: Option<Value>,
    pub cache_key: Option<String>,
    pub if_none_match: Option<String>,
    pub if_none_match_provided: bool,
    pub if_none_match_valid: bool,
    pub client_tools_hash_sync_supported: bool,
}

impl PendingRequest {
    pub fn for_method(method: &str) -> Self {
        Self {
            method: method.to_string(),
            ..Default::default()
        }
    }
}

/// All mutable per-session state.
pub struct ProxySession {
    pub state: ProxyState,
    pub metrics: ProxyMetrics,
    pub health: HealthTracker,
    pub token_counter: TokenCounter,
    pub key_registry: KeyDictionaryRegistry,
    pub delta_counters: HashMap<String, u64>,
    pub tools_hash_negotiated: bool,
    pub(crate) pending: HashMap<String, PendingRequest>,
}

impl ProxySession {
    pub fn new(cache_max_entries: usize, key_bootstrap_interval: u64) -> Self {
        Self {
            state: ProxyState::new(cache_max_entries),
            metrics: ProxyMetrics::default(),
            health: HealthTracker::new(),
            token_counter: TokenCounter::new(),
            key_registry: KeyDictionaryRegistry::new(key_bootstrap_interval),
            delta_counters: HashMap::new(),
            tools_hash_negotiated: false,
            pending: HashMap::new(),
        }
    }

    /// Request ids may be numbers or strings; key by their canonical
    /// serialized form so `1` and `"1"` stay distinct.
    fn pending_key(id: &Value) -> String {
        serde_json::to_string(id).unwrap_or_default()
    }

    pub fn pending_insert(&mut self, id: &Value, request: PendingRequest) {
        self.pending.insert(Self::pending_key(id), request);
    }

    pub fn pending_remove(&mut self, id: &Value) -> Option<PendingRequest> {
        self.pending.remove(&Self::pending_key(id))
    }

    pub fn pending_method(&self, id: &Value) -> Option<&str> {
        self.pending
            .get(&Self::pending_key(id))
            .map(|p| p.method.as_str())
    }
}
