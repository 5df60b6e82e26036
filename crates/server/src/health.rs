//! Auto-disable health tracking for optimization features.
//!
//! Each `(feature, tool)` pair carries a regression streak. Outcomes that
//! hurt (negative token savings) grow the streak; once it reaches the
//! configured threshold the feature is bypassed for a cooldown window of
//! requests before it gets another chance.

use crate::config::ProxyConfig;
use std::collections::HashMap;

/// Outcome of one optimization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureOutcome {
    /// The optimization shipped and saved tokens.
    Success,
    /// The optimization was skipped or broke even.
    Neutral,
    /// The optimization would have cost tokens.
    Hurt,
}

#[derive(Debug, Default, Clone)]
struct FeatureHealth {
    regression_streak: u32,
    cooldown_remaining: u32,
}

/// Per-session health ledger, keyed by `"{feature}:{tool}"`.
#[derive(Debug, Default)]
pub struct HealthTracker {
    states: HashMap<String, FeatureHealth>,
}

fn health_key(feature: &str, tool_name: Option<&str>) -> String {
    format!("{feature}:{}", tool_name.unwrap_or("_global"))
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the feature may run for this tool right now. Consumes one
    /// cooldown tick when the feature is benched.
    pub fn is_active(&mut self, feature: &str, tool_name: Option<&str>, cfg: &ProxyConfig) -> bool {
        if !cfg.auto_disable_enabled {
            return true;
        }
        let state = self.states.entry(health_key(feature, tool_name)).or_default();
        if state.cooldown_remaining > 0 {
            state.cooldown_remaining -= 1;
            return false;
        }
        true
    }

    /// Records the outcome of one attempt.
    pub fn record(
        &mut self,
        feature: &str,
        tool_name: Option<&str>,
        outcome: FeatureOutcome,
        cfg: &ProxyConfig,
    ) {
        if !cfg.auto_disable_enabled {
            return;
        }
        let state = self.states.entry(health_key(feature, tool_name)).or_default();
        match outcome {
            FeatureOutcome::Success => state.regression_streak = 0,
            FeatureOutcome::Neutral => {
                state.regression_streak = state.regression_streak.saturating_sub(1);
            }
            FeatureOutcome::Hurt => {
                state.regression_streak += 1;
                if state.regression_streak >= cfg.auto_disable_threshold {
                    state.regression_streak = 0;
                    state.cooldown_remaining = cfg.auto_disable_cooldown_requests;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ProxyConfig {
        ProxyConfig {
            auto_disable_enabled: true,
            auto_disable_threshold: 3,
            auto_disable_cooldown_requests: 2,
            ..Default::default()
        }
    }

    #[test]
    fn hurt_streak_triggers_cooldown_then_recovers() {
        let cfg = cfg();
        let mut tracker = HealthTracker::new();

        for _ in 0..3 {
            assert!(tracker.is_active("result_compression", Some("list_items"), &cfg));
            tracker.record(
                "result_compression",
                Some("list_items"),
                FeatureOutcome::Hurt,
                &cfg,
            );
        }
        // Benched for exactly the cooldown window.
        assert!(!tracker.is_active("result_compression", Some("list_items"), &cfg));
        assert!(!tracker.is_active("result_compression", Some("list_items"), &cfg));
        assert!(tracker.is_active("result_compression", Some("list_items"), &cfg));
    }

    #[test]
    fn success_resets_the_streak() {
        let cfg = cfg();
        let mut tracker = HealthTracker::new();
        tracker.record("delta", Some("t"), FeatureOutcome::Hurt, &cfg);
        tracker.record("delta", Some("t"), FeatureOutcome::Hurt, &cfg);
        tracker.record("delta", Some("t"), FeatureOutcome::Success, &cfg);
        tracker.record("delta", Some("t"), FeatureOutcome::Hurt, &cfg);
        tracker.record("delta", Some("t"), FeatureOutcome::Hurt, &cfg);
        assert!(tracker.is_active("delta", Some("t"), &cfg));
    }

    #[test]
    fn neutral_outcomes_decay_the_streak() {
        let cfg = cfg();
        let mut tracker = HealthTracker::new();
        tracker.record("delta", None, FeatureOutcome::Hurt, &cfg);
        tracker.record("delta", None, FeatureOutcome::Hurt, &cfg);
        tracker.record("delta", None, FeatureOutcome::Neutral, &cfg);
        tracker.record("delta", None, FeatureOutcome::Hurt, &cfg);
        // 2 - 1 + 1 = 2 < threshold, so still active.
        assert!(tracker.is_active("delta", None, &cfg));
    }

    #[test]
    fn disabled_tracking_never_benches() {
        let cfg = ProxyConfig {
            auto_disable_enabled: false,
            ..Default::default()
        };
        let mut tracker = HealthTracker::new();
        for _ in 0..10 {
            tracker.record("x", None, FeatureOutcome::Hurt, &cfg);
            assert!(tracker.is_active("x", None, &cfg));
        }
    }
}
