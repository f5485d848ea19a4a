//! Coordinator configuration.
//!
//! Configuration can be loaded from a repository-level `swarm.toml` and
//! adjusted at runtime through the `claim_config` operation. Both paths reject
//! unknown keys. Keys use camelCase in TOML and JSON alike, matching the tool
//! contract.

use chrono::Duration;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::errors::{CoordResult, CoordinatorError};

/// Strategy for picking which claims to move off an overloaded claimant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum MoveStrategy {
    OldestFirst,
    NewestFirst,
    LowestPriority,
    LeastProgress,
    CapabilityMatch,
}

/// All tunable knobs of the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CoordinatorConfig {
    /// Default TTL applied to fresh claims; 0 means claims do not expire
    pub default_expiration_ms: u64,
    /// Hard cap on non-terminal claims per claimant (profile may lower it)
    pub max_claims_per_agent: u32,
    /// Length of the contest window opened by a successful steal
    pub contest_window_ms: u64,
    /// Auto-release claims idle this long; 0 disables
    pub auto_release_on_inactivity_ms: u64,
    /// Inactivity span after which an active claim may be auto-marked stealable
    pub stale_threshold_minutes: u64,
    /// Time in `blocked` after which a claim may be auto-marked stealable
    pub blocked_threshold_minutes: u64,
    /// Active-claim count above which a claimant counts as overloaded for marking
    pub overload_threshold: u32,
    /// Span after claiming during which a claim cannot be marked or stolen
    pub grace_period_minutes: u64,
    /// Progress at or above which a claim cannot be stolen or moved
    pub min_progress_to_protect: u8,
    /// Whether agents of differing types may steal from each other at all
    pub allow_cross_type_steal: bool,
    /// Unordered agent-type pairs allowed to steal from each other
    pub cross_type_steal_rules: Vec<[String; 2]>,
    /// Load percentage at or above which a claimant is overloaded
    pub rebalance_overloaded_pct: u32,
    /// Load percentage at or below which a claimant is underloaded
    pub rebalance_underloaded_pct: u32,
    /// Minimum max-min load spread (points) for a pass to act
    pub rebalance_spread_trigger: u32,
    /// Period of the automatic rebalance timer
    pub rebalance_interval_ms: u64,
    /// Minimum gap between applied rebalance passes
    pub rebalance_cooldown_ms: u64,
    /// Upper bound on moves taken from one claimant per pass
    pub max_moves_per_rebalance: u32,
    /// How candidate claims are picked from an overloaded claimant
    pub rebalance_strategy: MoveStrategy,
    /// Whether move targets must cover the claim's capability requirements
    pub respect_capabilities: bool,
    /// Deadline for entering an operation's critical section
    pub op_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_expiration_ms: 0,
            max_claims_per_agent: 5,
            contest_window_ms: 300_000,
            auto_release_on_inactivity_ms: 0,
            stale_threshold_minutes: 30,
            blocked_threshold_minutes: 60,
            overload_threshold: 5,
            grace_period_minutes: 10,
            min_progress_to_protect: 75,
            allow_cross_type_steal: true,
            cross_type_steal_rules: vec![
                ["coder".to_string(), "debugger".to_string()],
                ["tester".to_string(), "reviewer".to_string()],
            ],
            rebalance_overloaded_pct: 90,
            rebalance_underloaded_pct: 30,
            rebalance_spread_trigger: 40,
            rebalance_interval_ms: 300_000,
            rebalance_cooldown_ms: 600_000,
            max_moves_per_rebalance: 3,
            rebalance_strategy: MoveStrategy::LowestPriority,
            respect_capabilities: true,
            op_timeout_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file. Missing keys fall back to
    /// defaults; unknown keys are rejected.
    pub fn from_file(path: &Path) -> CoordResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::validation(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let config: CoordinatorConfig = toml::from_str(&content).map_err(|e| {
            CoordinatorError::validation(format!("failed to parse config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Merge a partial JSON update into this configuration.
    ///
    /// The update must be an object; unknown keys and out-of-range values are
    /// rejected and leave the configuration untouched.
    pub fn apply_update(&self, update: &serde_json::Value) -> CoordResult<Self> {
        let updates = update
            .as_object()
            .ok_or_else(|| CoordinatorError::validation("config update must be an object"))?;

        let mut merged = serde_json::to_value(self)
            .map_err(|e| CoordinatorError::internal(format!("config serialization: {}", e)))?;
        let map = merged.as_object_mut().expect("config serializes to object");
        for (key, value) in updates {
            map.insert(key.clone(), value.clone());
        }

        let next: CoordinatorConfig = serde_json::from_value(merged)
            .map_err(|e| CoordinatorError::validation(format!("invalid config update: {}", e)))?;
        next.validate()?;
        Ok(next)
    }

    /// Reject values that would make time or progress arithmetic nonsensical.
    pub fn validate(&self) -> CoordResult<()> {
        if self.min_progress_to_protect > 100 {
            return Err(CoordinatorError::validation(
                "minProgressToProtect must be within 0-100",
            ));
        }
        if self.max_claims_per_agent == 0 {
            return Err(CoordinatorError::validation(
                "maxClaimsPerAgent must be at least 1",
            ));
        }
        if self.rebalance_underloaded_pct >= self.rebalance_overloaded_pct {
            return Err(CoordinatorError::validation(
                "rebalanceUnderloadedPct must be below rebalanceOverloadedPct",
            ));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::minutes(self.grace_period_minutes as i64)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::minutes(self.stale_threshold_minutes as i64)
    }

    pub fn blocked_threshold(&self) -> Duration {
        Duration::minutes(self.blocked_threshold_minutes as i64)
    }

    pub fn contest_window(&self) -> Duration {
        Duration::milliseconds(self.contest_window_ms as i64)
    }

    pub fn default_expiration(&self) -> Option<Duration> {
        (self.default_expiration_ms > 0)
            .then(|| Duration::milliseconds(self.default_expiration_ms as i64))
    }

    pub fn op_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.op_timeout_ms)
    }

    /// Check whether the unordered type pair is allowed to steal across.
    pub fn cross_type_allowed(&self, a: &str, b: &str) -> bool {
        if !self.allow_cross_type_steal {
            return false;
        }
        self.cross_type_steal_rules
            .iter()
            .any(|[x, y]| (x == a && y == b) || (x == b && y == a))
    }
}

/// Shared, runtime-updatable configuration handle.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<CoordinatorConfig>>,
}

impl SharedConfig {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> CoordinatorConfig {
        self.inner.read().unwrap().clone()
    }

    /// Replace the configuration wholesale.
    pub fn set(&self, config: CoordinatorConfig) {
        *self.inner.write().unwrap() = config;
    }

    /// Apply a partial update and return the new configuration.
    pub fn update(&self, update: &serde_json::Value) -> CoordResult<CoordinatorConfig> {
        let mut guard = self.inner.write().unwrap();
        let next = guard.apply_update(update)?;
        *guard = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.grace_period_minutes, 10);
        assert_eq!(config.stale_threshold_minutes, 30);
        assert_eq!(config.blocked_threshold_minutes, 60);
        assert_eq!(config.contest_window_ms, 300_000);
        assert_eq!(config.min_progress_to_protect, 75);
        assert_eq!(config.overload_threshold, 5);
        assert_eq!(config.rebalance_overloaded_pct, 90);
        assert_eq!(config.rebalance_underloaded_pct, 30);
        assert_eq!(config.rebalance_spread_trigger, 40);
    }

    #[test]
    fn update_merges_known_keys() {
        let config = CoordinatorConfig::default();
        let next = config
            .apply_update(&json!({"maxClaimsPerAgent": 8, "graceMinutes": null}))
            .unwrap_err();
        assert_eq!(next.kind(), "validation-error");

        let next = config
            .apply_update(&json!({"maxClaimsPerAgent": 8}))
            .unwrap();
        assert_eq!(next.max_claims_per_agent, 8);
        // Untouched keys keep their values
        assert_eq!(next.contest_window_ms, 300_000);
    }

    #[test]
    fn update_rejects_unknown_keys() {
        let config = CoordinatorConfig::default();
        let err = config
            .apply_update(&json!({"noSuchKnob": true}))
            .unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn update_rejects_out_of_range_progress() {
        let config = CoordinatorConfig::default();
        let err = config
            .apply_update(&json!({"minProgressToProtect": 140}))
            .unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn cross_type_rules_are_unordered() {
        let config = CoordinatorConfig::default();
        assert!(config.cross_type_allowed("coder", "debugger"));
        assert!(config.cross_type_allowed("debugger", "coder"));
        assert!(config.cross_type_allowed("reviewer", "tester"));
        assert!(!config.cross_type_allowed("coder", "reviewer"));
    }

    #[test]
    fn cross_type_disabled_blocks_all_pairs() {
        let config = CoordinatorConfig {
            allow_cross_type_steal: false,
            ..Default::default()
        };
        assert!(!config.cross_type_allowed("coder", "debugger"));
    }

    #[test]
    fn from_file_loads_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarm.toml");
        std::fs::write(&path, "maxClaimsPerAgent = 3\ngracePeriodMinutes = 2\n").unwrap();

        let config = CoordinatorConfig::from_file(&path).unwrap();
        assert_eq!(config.max_claims_per_agent, 3);
        assert_eq!(config.grace_period_minutes, 2);
        // Everything else is defaulted
        assert_eq!(config.stale_threshold_minutes, 30);
    }

    #[test]
    fn from_file_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarm.toml");
        std::fs::write(&path, "bogusKey = 1\n").unwrap();

        assert!(CoordinatorConfig::from_file(&path).is_err());
    }

    #[test]
    fn shared_config_update_is_visible_to_readers() {
        let shared = SharedConfig::new(CoordinatorConfig::default());
        shared.update(&json!({"contestWindowMs": 60_000})).unwrap();
        assert_eq!(shared.get().contest_window_ms, 60_000);
    }
}
