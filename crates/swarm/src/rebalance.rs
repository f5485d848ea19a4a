//! Load rebalancing across claimants.
//!
//! A pass snapshots the load index, decides whether the configured bands are
//! breached (someone overloaded and a wide enough spread), plans moves from
//! overloaded to underloaded claimants, and either returns the plan (dry run)
//! or applies it move by move. Moves release the source claim with cause
//! `rebalancing` and open a fresh claim for the target carrying priority and
//! progress; a move that races a concurrent mutation is skipped, never fatal.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, info};

use crate::config::MoveStrategy;
use crate::domain::{Claim, ClaimPriority, ClaimStatus, Claimant, ClaimantKind, ReleaseCause};
use crate::errors::CoordResult;
use crate::event_log::EventDraft;
use crate::events::{EventPayload, SWARM_AGGREGATE};
use crate::load::LoadSample;
use crate::manager::ClaimManager;

/// Caller-facing rebalance strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum RebalanceStrategy {
    /// Rotate targets across underloaded claimants
    RoundRobin,
    /// Always move to the least-loaded eligible claimant
    LeastLoaded,
    /// Move lowest-priority claims first
    PriorityBased,
    /// Prefer targets whose capabilities cover the claim's labels
    CapabilityBased,
}

impl RebalanceStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RebalanceStrategy::RoundRobin => "round-robin",
            RebalanceStrategy::LeastLoaded => "least-loaded",
            RebalanceStrategy::PriorityBased => "priority-based",
            RebalanceStrategy::CapabilityBased => "capability-based",
        }
    }
}

/// One planned claim migration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlannedMove {
    pub issue_id: String,
    pub claim_id: String,
    pub from_claimant: String,
    pub to_claimant: String,
    pub priority: ClaimPriority,
    pub progress: u8,
}

/// What happened to one planned move.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MoveOutcome {
    #[serde(flatten)]
    pub planned: PlannedMove,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_claim_id: Option<String>,
}

/// Result of one rebalance pass.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceReport {
    /// Whether the pass found anything to do
    pub triggered: bool,
    pub dry_run: bool,
    pub strategy: RebalanceStrategy,
    /// Why the pass was a no-op, when it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub moves: Vec<MoveOutcome>,
    pub before: Vec<LoadSample>,
    pub after: Vec<LoadSample>,
}

impl RebalanceReport {
    fn noop(strategy: RebalanceStrategy, dry_run: bool, reason: &str, before: Vec<LoadSample>) -> Self {
        Self {
            triggered: false,
            dry_run,
            strategy,
            reason: Some(reason.to_string()),
            moves: Vec::new(),
            after: before.clone(),
            before,
        }
    }
}

/// Strategy-driven claim migration between claimants.
pub struct Rebalancer {
    manager: Arc<ClaimManager>,
    last_applied: Mutex<Option<DateTime<Utc>>>,
}

impl Rebalancer {
    pub fn new(manager: Arc<ClaimManager>) -> Self {
        Self {
            manager,
            last_applied: Mutex::new(None),
        }
    }

    /// Run one rebalance pass.
    ///
    /// With `dry_run` the plan is returned without touching any state and
    /// without appending events. Applied passes respect the configured
    /// cooldown. Per-move races are recorded as skipped; the pass itself only
    /// fails on infrastructure errors.
    pub fn rebalance(
        &self,
        strategy: Option<RebalanceStrategy>,
        dry_run: bool,
    ) -> CoordResult<RebalanceReport> {
        let m = &self.manager;
        let config = m.config.get();
        let strategy = strategy.unwrap_or(RebalanceStrategy::LeastLoaded);
        let now = m.clock.now();

        if !dry_run {
            let last = *self.last_applied.lock().unwrap();
            if let Some(last) = last {
                let cooldown = chrono::Duration::milliseconds(config.rebalance_cooldown_ms as i64);
                if now < last + cooldown {
                    return Ok(RebalanceReport::noop(
                        strategy,
                        dry_run,
                        "cooldown",
                        m.load.snapshot(),
                    ));
                }
            }
        }

        let before = m.load.snapshot();
        let overloaded: Vec<&LoadSample> = before.iter().filter(|s| s.overloaded).collect();
        let max_load = before.iter().map(|s| s.load_percentage).max().unwrap_or(0);
        let min_load = before.iter().map(|s| s.load_percentage).min().unwrap_or(0);
        if overloaded.is_empty() {
            return Ok(RebalanceReport::noop(
                strategy,
                dry_run,
                "no claimant is overloaded",
                before,
            ));
        }
        if max_load.saturating_sub(min_load) < config.rebalance_spread_trigger {
            return Ok(RebalanceReport::noop(
                strategy,
                dry_run,
                "load spread below trigger",
                before,
            ));
        }

        let plan = self.plan_moves(strategy, &before);
        if plan.is_empty() {
            return Ok(RebalanceReport::noop(
                strategy,
                dry_run,
                "no movable claims or no eligible targets",
                before,
            ));
        }

        if dry_run {
            let moves = plan
                .into_iter()
                .map(|planned| MoveOutcome {
                    planned,
                    applied: false,
                    skipped_reason: None,
                    new_claim_id: None,
                })
                .collect();
            return Ok(RebalanceReport {
                triggered: true,
                dry_run,
                strategy,
                reason: None,
                moves,
                after: before.clone(),
                before,
            });
        }

        let moves = self.apply_moves(&plan)?;
        let after = m.load.snapshot();
        let applied = moves.iter().filter(|m| m.applied).count();

        m.commit(vec![EventDraft::new(
            SWARM_AGGREGATE,
            None,
            EventPayload::SwarmRebalanced {
                strategy: strategy.as_str().to_string(),
                moves_planned: moves.len(),
                moves_applied: applied,
                before: before.clone(),
                after: after.clone(),
            },
        )])?;
        *self.last_applied.lock().unwrap() = Some(now);
        info!(applied, planned = moves.len(), strategy = strategy.as_str(), "rebalance pass applied");

        Ok(RebalanceReport {
            triggered: true,
            dry_run,
            strategy,
            reason: None,
            moves,
            before,
            after,
        })
    }

    /// Build the move plan from a load snapshot, walking overloaded claimants
    /// highest-load first.
    fn plan_moves(&self, strategy: RebalanceStrategy, snapshot: &[LoadSample]) -> Vec<PlannedMove> {
        let m = &self.manager;
        let config = m.config.get();
        let now = m.clock.now();

        let mut sources: Vec<&LoadSample> = snapshot.iter().filter(|s| s.overloaded).collect();
        sources.sort_by(|a, b| b.load_percentage.cmp(&a.load_percentage));

        // Track planned additions so successive moves see targets filling up
        let mut planned_extra: HashMap<String, usize> = HashMap::new();
        let mut round_robin = 0usize;
        let mut plan = Vec::new();

        for source in sources {
            let mut candidates: Vec<Claim> = m
                .store
                .claims_for(&source.claimant_id)
                .into_iter()
                .filter(|c| c.status == ClaimStatus::Active)
                .filter(|c| c.progress < config.min_progress_to_protect)
                .filter(|c| now >= c.claimed_at + config.grace_period())
                .collect();

            let selection = match strategy {
                RebalanceStrategy::PriorityBased => MoveStrategy::LowestPriority,
                RebalanceStrategy::CapabilityBased => MoveStrategy::CapabilityMatch,
                _ => config.rebalance_strategy,
            };
            match selection {
                MoveStrategy::OldestFirst => candidates.sort_by_key(|c| c.claimed_at),
                MoveStrategy::NewestFirst => {
                    candidates.sort_by_key(|c| std::cmp::Reverse(c.claimed_at))
                }
                MoveStrategy::LowestPriority => {
                    candidates.sort_by_key(|c| std::cmp::Reverse(c.priority.rank()))
                }
                MoveStrategy::LeastProgress => candidates.sort_by_key(|c| c.progress),
                MoveStrategy::CapabilityMatch => candidates.sort_by_key(|c| c.claimed_at),
            }

            for claim in candidates.into_iter().take(config.max_moves_per_rebalance as usize) {
                let require_capabilities = config.respect_capabilities
                    || strategy == RebalanceStrategy::CapabilityBased;
                let target = self.pick_target(
                    snapshot,
                    &source.claimant_id,
                    &claim,
                    require_capabilities,
                    strategy,
                    &planned_extra,
                    &mut round_robin,
                );
                let Some(target_id) = target else {
                    debug!(issue_id = %claim.issue_id, "no eligible rebalance target");
                    continue;
                };
                *planned_extra.entry(target_id.clone()).or_default() += 1;
                plan.push(PlannedMove {
                    issue_id: claim.issue_id.clone(),
                    claim_id: claim.claim_id.clone(),
                    from_claimant: source.claimant_id.clone(),
                    to_claimant: target_id,
                    priority: claim.priority,
                    progress: claim.progress,
                });
            }
        }
        plan
    }

    /// Pick the best underloaded claimant for one claim.
    #[allow(clippy::too_many_arguments)]
    fn pick_target(
        &self,
        snapshot: &[LoadSample],
        source_id: &str,
        claim: &Claim,
        require_capabilities: bool,
        strategy: RebalanceStrategy,
        planned_extra: &HashMap<String, usize>,
        round_robin: &mut usize,
    ) -> Option<String> {
        let m = &self.manager;
        let required: Vec<String> = m
            .catalog
            .get(&claim.issue_id)
            .map(|issue| issue.labels)
            .unwrap_or_default();

        let mut eligible: Vec<(&LoadSample, u32)> = snapshot
            .iter()
            .filter(|s| s.underloaded && s.claimant_id != source_id)
            .filter(|s| {
                let extra = planned_extra.get(&s.claimant_id).copied().unwrap_or(0);
                s.active_claims + s.paused_claims + extra < s.max_concurrent_claims as usize
            })
            .filter(|s| {
                if !require_capabilities || required.is_empty() {
                    return true;
                }
                let capabilities = m
                    .directory
                    .get(&s.claimant_id)
                    .map(|p| p.capabilities)
                    .unwrap_or_default();
                required.iter().all(|need| capabilities.contains(need))
            })
            .map(|s| {
                let extra = planned_extra.get(&s.claimant_id).copied().unwrap_or(0) as u32;
                let effective = (s.active_claims as u32 + extra) * 100
                    / s.max_concurrent_claims.max(1);
                (s, effective)
            })
            .collect();
        eligible.sort_by(|(a, a_load), (b, b_load)| {
            a_load.cmp(b_load).then_with(|| a.claimant_id.cmp(&b.claimant_id))
        });

        if eligible.is_empty() {
            return None;
        }
        let index = match strategy {
            RebalanceStrategy::RoundRobin => {
                let index = *round_robin % eligible.len();
                *round_robin += 1;
                index
            }
            _ => 0,
        };
        Some(eligible[index].0.claimant_id.clone())
    }

    /// Apply a plan, taking every source issue's critical section in
    /// deterministic order first.
    fn apply_moves(&self, plan: &[PlannedMove]) -> CoordResult<Vec<MoveOutcome>> {
        let m = &self.manager;
        let issue_ids: Vec<String> = plan.iter().map(|mv| mv.issue_id.clone()).collect();
        let _guards = m.locks.acquire_many(&issue_ids, m.op_timeout())?;

        let mut outcomes = Vec::with_capacity(plan.len());
        for planned in plan {
            let outcome = self.apply_one(planned);
            outcomes.push(match outcome {
                Ok(new_claim_id) => MoveOutcome {
                    planned: planned.clone(),
                    applied: true,
                    skipped_reason: None,
                    new_claim_id: Some(new_claim_id),
                },
                Err(reason) => {
                    debug!(issue_id = %planned.issue_id, %reason, "rebalance move skipped");
                    MoveOutcome {
                        planned: planned.clone(),
                        applied: false,
                        skipped_reason: Some(reason),
                        new_claim_id: None,
                    }
                }
            });
        }
        Ok(outcomes)
    }

    /// Apply one move; a failure is a skip reason, not an error.
    fn apply_one(&self, planned: &PlannedMove) -> Result<String, String> {
        let m = &self.manager;

        // Re-validate under the lock: the claim may have changed since planning
        let claim = m
            .store
            .active_claim(&planned.issue_id)
            .ok_or("claim no longer active")?;
        if claim.claim_id != planned.claim_id || claim.claimant.id != planned.from_claimant {
            return Err("claim changed since planning".to_string());
        }
        if claim.status != ClaimStatus::Active {
            return Err(format!("claim is {}, not active", claim.status));
        }
        let max = m.load.max_claims_for(&planned.to_claimant);
        if m.load.non_terminal(&planned.to_claimant) >= max as usize {
            return Err(format!("target {} is at capacity", planned.to_claimant));
        }

        let target_kind = m
            .directory
            .get(&planned.to_claimant)
            .map(|p| p.kind)
            .unwrap_or(ClaimantKind::Agent);
        let target = m.resolve_claimant(Claimant {
            id: planned.to_claimant.clone(),
            kind: target_kind,
            agent_type: None,
            capabilities: Vec::new(),
        });

        let now = m.clock.now();
        let config = m.config.get();
        let new_claim = Claim::open(
            m.ids.claim_id(),
            planned.issue_id.clone(),
            target,
            claim.priority,
            now,
            config.default_expiration().map(|d| now + d),
            claim.progress,
            None,
        );

        m.commit(vec![
            EventDraft::new(
                claim.claim_id.clone(),
                Some(planned.issue_id.clone()),
                EventPayload::ClaimReleased {
                    by: claim.claimant.id.clone(),
                    cause: ReleaseCause::Rebalancing,
                    reason: Some(format!("rebalanced to {}", planned.to_claimant)),
                },
            ),
            EventDraft::new(
                new_claim.claim_id.clone(),
                Some(planned.issue_id.clone()),
                EventPayload::ClaimCreated {
                    claim: new_claim.clone(),
                },
            ),
        ])
        .map_err(|e| e.to_string())?;
        Ok(new_claim.claim_id)
    }

    /// Start the periodic trigger thread.
    ///
    /// The thread wakes on bus traffic or at least once per second, and runs
    /// a pass whenever the configured interval has elapsed; thresholds and
    /// cooldown inside `rebalance` keep idle passes cheap.
    pub fn spawn_periodic(self: &Arc<Self>) -> RebalanceTimer {
        let rebalancer = Arc::clone(self);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let events = rebalancer.manager.bus.subscribe();

        let handle = std::thread::spawn(move || {
            let mut last_attempt = Instant::now();
            loop {
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                let disconnected = matches!(
                    events.recv_timeout(StdDuration::from_secs(1)),
                    Err(RecvTimeoutError::Disconnected)
                );
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                let interval = StdDuration::from_millis(
                    rebalancer.manager.config.get().rebalance_interval_ms,
                );
                if last_attempt.elapsed() >= interval {
                    last_attempt = Instant::now();
                    if let Err(err) = rebalancer.rebalance(None, false) {
                        debug!(%err, "periodic rebalance pass failed");
                    }
                }
                if disconnected {
                    // No publishers left; fall back to pure timer ticks
                    std::thread::sleep(StdDuration::from_secs(1));
                }
            }
        });

        RebalanceTimer {
            stop,
            handle: Some(handle),
        }
    }
}

/// Handle for the periodic rebalance thread; stops it on drop.
pub struct RebalanceTimer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for RebalanceTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
