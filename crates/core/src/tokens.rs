//! Deterministic token estimation for savings gates.

use crate::json::json_size;
use serde_json::Value;

/// Estimates language-model token counts for JSON payloads.
///
/// Uses the ~4-characters-per-token approximation for JSON text. The
/// estimate only ever gates whether an optimization is worth shipping,
/// so determinism matters more than tokenizer fidelity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter;

impl TokenCounter {
    pub fn new() -> Self {
        Self
    }

    /// Estimated token count for the compact serialization of `value`.
    pub fn count(&self, value: &Value) -> usize {
        std::cmp::max(1, json_size(value) / 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn count_never_returns_zero() {
        assert_eq!(TokenCounter::new().count(&json!(null)), 1);
    }

    #[test]
    fn count_scales_with_payload_size() {
        let counter = TokenCounter::new();
        let small = json!({"a": 1});
        let large = json!({"items": (0..50).map(|i| json!({"id": i, "name": format!("item_{i}")})).collect::<Vec<_>>()});
        assert!(counter.count(&large) > counter.count(&small) * 10);
    }
}
