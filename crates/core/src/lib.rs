//! Algorithmic core for the `ultra-lean-mcp-proxy` workspace.
//!
//! Everything in this crate is pure: no I/O, no clocks, no shared state.
//! The proxy runtime composes these primitives into its interception
//! pipeline:
//!
//! - `json`: canonicalization, stable hashing, and size accounting for
//!   free-form JSON values.
//! - `keys`: cache-key construction and the mutating-tool-name heuristic.
//! - `tokens`: deterministic token estimation for savings gates.
//! - `compress`: rule-based description compaction for tool definitions.
//! - `delta`: structural JSON diff envelopes (`lapc-delta-v1`).
//! - `result`: reversible structured-result compression (`lapc-json-v1`).

pub mod compress;
pub mod delta;
pub mod json;
pub mod keys;
pub mod result;
pub mod tokens;

pub use compress::{compress_description, compress_schema};
pub use delta::{apply_delta, create_delta, DeltaError, DeltaOptions, DELTA_ENCODING};
pub use json::{canonical_json, canonicalize, json_size, stable_hash};
pub use keys::{args_hash, is_mutating_tool_name, make_cache_key};
pub use result::{
    compress_result, decompress_result, estimate_compressibility, token_savings,
    CompressionMode, CompressionOptions, EnvelopeError, KeyDictionaryRegistry, RESULT_ENCODING,
};
pub use tokens::TokenCounter;
