//! Per-claimant load accounting.
//!
//! The index is maintained incrementally as claims open, transition, and
//! close, and can always be recounted from the claim store (it is a derived
//! view, not a source of truth). Utilization is active claims over the
//! claimant's capacity; the over/underloaded classification drives the
//! rebalancer.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::catalog::ClaimantDirectory;
use crate::config::SharedConfig;
use crate::domain::{Claim, ClaimStatus, ClaimantKind};

/// Derived load figures for one claimant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadSample {
    pub claimant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ClaimantKind>,
    /// Non-terminal claims currently consuming attention (everything but paused)
    pub active_claims: usize,
    pub paused_claims: usize,
    /// Lifetime completed count
    pub completed_claims: usize,
    pub max_concurrent_claims: u32,
    /// `active_claims * 100 / max_concurrent_claims`
    pub load_percentage: u32,
    pub overloaded: bool,
    pub underloaded: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Counters {
    kind: Option<ClaimantKind>,
    active: usize,
    paused: usize,
    completed: usize,
}

/// How a status contributes to load accounting.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Active,
    Paused,
    Terminal,
}

fn slot(status: ClaimStatus) -> Slot {
    match status {
        ClaimStatus::Paused => Slot::Paused,
        s if s.is_terminal() => Slot::Terminal,
        _ => Slot::Active,
    }
}

/// Incrementally maintained load index.
pub struct LoadIndex {
    counters: RwLock<HashMap<String, Counters>>,
    config: SharedConfig,
    directory: Arc<dyn ClaimantDirectory>,
}

impl LoadIndex {
    pub fn new(config: SharedConfig, directory: Arc<dyn ClaimantDirectory>) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            config,
            directory,
        }
    }

    /// Record a claim moving between statuses for a claimant.
    ///
    /// `from = None` means the claim was just opened.
    pub fn on_transition(
        &self,
        claimant_id: &str,
        kind: ClaimantKind,
        from: Option<ClaimStatus>,
        to: ClaimStatus,
    ) {
        let mut counters = self.counters.write().unwrap();
        let entry = counters.entry(claimant_id.to_string()).or_default();
        entry.kind = Some(kind);

        if let Some(from) = from {
            match slot(from) {
                Slot::Active => entry.active = entry.active.saturating_sub(1),
                Slot::Paused => entry.paused = entry.paused.saturating_sub(1),
                Slot::Terminal => {}
            }
        }
        match slot(to) {
            Slot::Active => entry.active += 1,
            Slot::Paused => entry.paused += 1,
            Slot::Terminal => {
                if to == ClaimStatus::Completed {
                    entry.completed += 1;
                }
            }
        }
    }

    /// Capacity for a claimant: profile override, else the configured cap.
    pub fn max_claims_for(&self, claimant_id: &str) -> u32 {
        self.directory
            .get(claimant_id)
            .and_then(|p| p.max_concurrent_claims)
            .unwrap_or_else(|| self.config.get().max_claims_per_agent)
    }

    /// Count of non-terminal claims (active and paused) held by a claimant.
    pub fn non_terminal(&self, claimant_id: &str) -> usize {
        self.counters
            .read()
            .unwrap()
            .get(claimant_id)
            .map(|c| c.active + c.paused)
            .unwrap_or(0)
    }

    /// Current load figures for one claimant.
    pub fn sample(&self, claimant_id: &str) -> LoadSample {
        let counters = self.counters.read().unwrap();
        let entry = counters.get(claimant_id).cloned().unwrap_or_default();
        drop(counters);
        self.sample_from(claimant_id, &entry)
    }

    fn sample_from(&self, claimant_id: &str, entry: &Counters) -> LoadSample {
        let config = self.config.get();
        let max = self.max_claims_for(claimant_id).max(1);
        let load_percentage = (entry.active as u32).saturating_mul(100) / max;
        LoadSample {
            claimant_id: claimant_id.to_string(),
            kind: entry.kind,
            active_claims: entry.active,
            paused_claims: entry.paused,
            completed_claims: entry.completed,
            max_concurrent_claims: max,
            load_percentage,
            overloaded: load_percentage >= config.rebalance_overloaded_pct,
            underloaded: load_percentage <= config.rebalance_underloaded_pct,
        }
    }

    /// Load figures for every known claimant, ordered by id.
    pub fn snapshot(&self) -> Vec<LoadSample> {
        let counters = self.counters.read().unwrap();
        let mut samples: Vec<LoadSample> = counters
            .iter()
            .map(|(id, entry)| self.sample_from(id, entry))
            .collect();
        samples.sort_by(|a, b| a.claimant_id.cmp(&b.claimant_id));
        samples
    }

    /// Claimants currently above the overload threshold.
    pub fn overloaded(&self) -> Vec<LoadSample> {
        self.snapshot().into_iter().filter(|s| s.overloaded).collect()
    }

    /// Claimants currently at or below the underload threshold.
    pub fn underloaded(&self) -> Vec<LoadSample> {
        self.snapshot().into_iter().filter(|s| s.underloaded).collect()
    }

    /// Recount every counter from the authoritative claim list.
    ///
    /// Returns `true` if the recount found and healed a divergence.
    pub fn recount_from(&self, claims: &[Claim]) -> bool {
        let mut fresh: HashMap<String, Counters> = HashMap::new();
        for claim in claims {
            let entry = fresh.entry(claim.claimant.id.clone()).or_default();
            entry.kind = Some(claim.claimant.kind);
            match slot(claim.status) {
                Slot::Active => entry.active += 1,
                Slot::Paused => entry.paused += 1,
                Slot::Terminal => {
                    if claim.status == ClaimStatus::Completed {
                        entry.completed += 1;
                    }
                }
            }
        }

        let mut counters = self.counters.write().unwrap();
        // Claimants seen before stay present even if no stored claim mentions them
        for (id, old) in counters.iter() {
            fresh
                .entry(id.clone())
                .or_insert_with(|| Counters {
                    kind: old.kind,
                    ..Counters::default()
                });
        }
        let diverged = *counters != fresh;
        if diverged {
            warn!("load index diverged from claim store, healing from recount");
            *counters = fresh;
        }
        diverged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ClaimantProfile, InMemoryClaimantDirectory};
    use crate::config::CoordinatorConfig;
    use crate::domain::{ClaimPriority, Claimant};
    use chrono::Utc;

    fn index() -> (Arc<InMemoryClaimantDirectory>, LoadIndex) {
        let directory = Arc::new(InMemoryClaimantDirectory::new());
        let index = LoadIndex::new(
            SharedConfig::new(CoordinatorConfig::default()),
            directory.clone(),
        );
        (directory, index)
    }

    #[test]
    fn open_and_close_update_counts() {
        let (_dir, index) = index();
        index.on_transition("agent:a1", ClaimantKind::Agent, None, ClaimStatus::Active);
        index.on_transition("agent:a1", ClaimantKind::Agent, None, ClaimStatus::Active);
        assert_eq!(index.sample("agent:a1").active_claims, 2);

        index.on_transition(
            "agent:a1",
            ClaimantKind::Agent,
            Some(ClaimStatus::Active),
            ClaimStatus::Completed,
        );
        let sample = index.sample("agent:a1");
        assert_eq!(sample.active_claims, 1);
        assert_eq!(sample.completed_claims, 1);
    }

    #[test]
    fn pause_moves_between_slots() {
        let (_dir, index) = index();
        index.on_transition("agent:a1", ClaimantKind::Agent, None, ClaimStatus::Active);
        index.on_transition(
            "agent:a1",
            ClaimantKind::Agent,
            Some(ClaimStatus::Active),
            ClaimStatus::Paused,
        );

        let sample = index.sample("agent:a1");
        assert_eq!(sample.active_claims, 0);
        assert_eq!(sample.paused_claims, 1);
        assert_eq!(index.non_terminal("agent:a1"), 1);
    }

    #[test]
    fn load_percentage_uses_profile_capacity() {
        let (directory, index) = index();
        directory.register(ClaimantProfile {
            id: "agent:a1".to_string(),
            kind: ClaimantKind::Agent,
            agent_type: None,
            max_concurrent_claims: Some(2),
            capabilities: vec![],
        });

        index.on_transition("agent:a1", ClaimantKind::Agent, None, ClaimStatus::Active);
        let sample = index.sample("agent:a1");
        assert_eq!(sample.max_concurrent_claims, 2);
        assert_eq!(sample.load_percentage, 50);
    }

    #[test]
    fn classification_follows_thresholds() {
        let (directory, index) = index();
        directory.register(ClaimantProfile {
            id: "agent:busy".to_string(),
            kind: ClaimantKind::Agent,
            agent_type: None,
            max_concurrent_claims: Some(2),
            capabilities: vec![],
        });

        index.on_transition("agent:busy", ClaimantKind::Agent, None, ClaimStatus::Active);
        index.on_transition("agent:busy", ClaimantKind::Agent, None, ClaimStatus::Active);
        index.on_transition("agent:idle", ClaimantKind::Agent, None, ClaimStatus::Active);

        assert!(index.sample("agent:busy").overloaded);
        // 1 of 5 => 20%, at or below the 30% underload threshold
        assert!(index.sample("agent:idle").underloaded);
        assert_eq!(index.overloaded().len(), 1);
        assert_eq!(index.underloaded().len(), 1);
    }

    #[test]
    fn recount_heals_divergence() {
        let (_dir, index) = index();
        // Seed a wrong counter
        index.on_transition("agent:a1", ClaimantKind::Agent, None, ClaimStatus::Active);
        index.on_transition("agent:a1", ClaimantKind::Agent, None, ClaimStatus::Active);

        let claim = Claim::open(
            "claim-1".to_string(),
            "issue-1".to_string(),
            Claimant {
                id: "agent:a1".to_string(),
                kind: ClaimantKind::Agent,
                agent_type: None,
                capabilities: vec![],
            },
            ClaimPriority::Medium,
            Utc::now(),
            None,
            0,
            None,
        );

        assert!(index.recount_from(&[claim]));
        assert_eq!(index.sample("agent:a1").active_claims, 1);
        // A matching recount reports no divergence
        assert!(!index.recount_from(&[Claim::open(
            "claim-1".to_string(),
            "issue-1".to_string(),
            Claimant {
                id: "agent:a1".to_string(),
                kind: ClaimantKind::Agent,
                agent_type: None,
                capabilities: vec![],
            },
            ClaimPriority::Medium,
            Utc::now(),
            None,
            0,
            None,
        )]));
    }
}
