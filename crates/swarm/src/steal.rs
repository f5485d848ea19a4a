//! Work stealing: marking, execution, and contest resolution.
//!
//! A claim becomes stealable either by its holder opting in or by the expiry
//! driver's scan (stale, blocked too long, holder overloaded). Stealing swaps
//! ownership in one projected step and opens a contest window during which the
//! displaced claimant may challenge the transfer; undecided contests resolve
//! in favor of the current holder when the window closes.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::debug;

use crate::domain::{
    Claim, ClaimPriority, ClaimStatus, Claimant, ClaimantKind, ContestInfo, ContestResolution,
    ReleaseCause, StealOrigin, StealableInfo, StealableReason,
};
use crate::errors::{CoordResult, CoordinatorError};
use crate::event_log::EventDraft;
use crate::events::EventPayload;
use crate::manager::ClaimManager;

/// Result of a successful steal.
#[derive(Debug, Clone)]
pub struct StealOutcome {
    pub new_claim: Claim,
    pub previous_claimant: String,
    pub contest_window_ends_at: Option<DateTime<Utc>>,
}

/// Result of a contest resolution.
#[derive(Debug, Clone)]
pub struct ContestOutcome {
    pub resolution: ContestResolution,
    /// The contested claim after resolution
    pub claim: Claim,
    /// Fresh claim opened for the challenger when the steal was reversed
    pub reinstated: Option<Claim>,
}

/// Steal rules and contest lifecycle over the claim manager.
pub struct StealEngine {
    manager: Arc<ClaimManager>,
}

impl StealEngine {
    pub fn new(manager: Arc<ClaimManager>) -> Self {
        Self { manager }
    }

    /// Open the issue's claim to stealing, on behalf of its holder.
    ///
    /// # Errors
    ///
    /// - `NotOwner` when the caller does not hold the claim
    /// - `InGrace` inside the post-claim grace period
    /// - `InvalidTransition` when already stealable or terminal
    pub fn mark_stealable(
        &self,
        issue_id: &str,
        claimant_id: &str,
        reason: StealableReason,
    ) -> CoordResult<Claim> {
        let m = &self.manager;
        let _guard = m.locks.acquire(issue_id, m.op_timeout())?;
        let claim = m.owned_active_claim(issue_id, claimant_id)?;
        self.mark_locked(&claim, reason)
    }

    /// Marking used by the scanner; ownership is implied by the scan.
    fn mark_locked(&self, claim: &Claim, reason: StealableReason) -> CoordResult<Claim> {
        let m = &self.manager;
        if !claim.status.can_transition_to(ClaimStatus::Stealable) {
            return Err(CoordinatorError::InvalidTransition {
                from: claim.status,
                to: ClaimStatus::Stealable,
            });
        }

        let config = m.config.get();
        let now = m.clock.now();
        let grace_ends = claim.claimed_at + config.grace_period();
        if now < grace_ends {
            return Err(CoordinatorError::InGrace {
                issue_id: claim.issue_id.clone(),
                until: grace_ends,
            });
        }

        let info = StealableInfo {
            reason,
            marked_at: now,
            grace_period_ends_at: now.max(grace_ends),
            min_priority_to_steal: None,
            requires_contest: true,
            original_claimant: Some(claim.claimant.id.clone()),
        };
        m.commit(vec![EventDraft::new(
            claim.claim_id.clone(),
            Some(claim.issue_id.clone()),
            EventPayload::MarkedStealable { info },
        )])?;
        Ok(m.store.get(&claim.claim_id).expect("claim just marked"))
    }

    /// Take over a stealable claim.
    ///
    /// The predecessor claim terminates as `stolen`; a fresh claim opens for
    /// the stealer carrying the predecessor's priority and progress, and the
    /// contest window starts.
    pub fn steal(
        &self,
        issue_id: &str,
        stealer: Claimant,
        reason: Option<String>,
    ) -> CoordResult<StealOutcome> {
        let m = &self.manager;
        let stealer = m.resolve_claimant(stealer);
        let _guard = m.locks.acquire(issue_id, m.op_timeout())?;

        let claim = m
            .store
            .active_claim(issue_id)
            .ok_or_else(|| CoordinatorError::NotClaimed {
                issue_id: issue_id.to_string(),
            })?;
        if claim.status != ClaimStatus::Stealable {
            return Err(CoordinatorError::NotStealable {
                issue_id: issue_id.to_string(),
            });
        }
        let info = claim.stealable.clone().ok_or_else(|| {
            CoordinatorError::internal(format!(
                "stealable claim {} has no stealable record",
                claim.claim_id
            ))
        })?;

        let config = m.config.get();
        let now = m.clock.now();
        if now < info.grace_period_ends_at {
            return Err(CoordinatorError::InGrace {
                issue_id: issue_id.to_string(),
                until: info.grace_period_ends_at,
            });
        }
        if claim.progress >= config.min_progress_to_protect {
            return Err(CoordinatorError::ProtectedByProgress {
                issue_id: issue_id.to_string(),
                progress: claim.progress,
            });
        }
        if let Some(min) = info.min_priority_to_steal {
            if claim.priority.rank() > min.rank() {
                return Err(CoordinatorError::NotStealable {
                    issue_id: issue_id.to_string(),
                });
            }
        }
        if stealer.id == claim.claimant.id {
            return Err(CoordinatorError::validation(
                "a claim cannot be stolen by its own holder",
            ));
        }
        if claim.claimant.kind == ClaimantKind::Agent && stealer.kind == ClaimantKind::Agent {
            if let (Some(holder_type), Some(stealer_type)) =
                (&claim.claimant.agent_type, &stealer.agent_type)
            {
                if holder_type != stealer_type
                    && !config.cross_type_allowed(holder_type, stealer_type)
                {
                    return Err(CoordinatorError::CrossTypeNotAllowed {
                        holder_type: holder_type.clone(),
                        stealer_type: stealer_type.clone(),
                    });
                }
            }
        }
        let max = m.load.max_claims_for(&stealer.id);
        if m.load.non_terminal(&stealer.id) >= max as usize {
            return Err(CoordinatorError::StealerOverloaded {
                stealer_id: stealer.id,
            });
        }

        let window = info
            .requires_contest
            .then(|| now + config.contest_window());
        let new_claim = Claim::open(
            m.ids.claim_id(),
            issue_id.to_string(),
            stealer,
            claim.priority,
            now,
            config.default_expiration().map(|d| now + d),
            claim.progress,
            Some(StealOrigin {
                previous_claim_id: claim.claim_id.clone(),
                previous_claimant: claim.claimant.id.clone(),
                stolen_at: now,
                contest_window_ends_at: window,
            }),
        );

        m.commit(vec![
            EventDraft::new(
                claim.claim_id.clone(),
                Some(issue_id.to_string()),
                EventPayload::IssueStolen {
                    new_claim_id: new_claim.claim_id.clone(),
                    stealer: new_claim.claimant.id.clone(),
                    previous_claimant: claim.claimant.id.clone(),
                    contest_window_ends_at: window,
                },
            )
            .correlated(new_claim.claim_id.clone()),
            EventDraft::new(
                new_claim.claim_id.clone(),
                Some(issue_id.to_string()),
                EventPayload::ClaimCreated {
                    claim: new_claim.clone(),
                },
            )
            .correlated(new_claim.claim_id.clone()),
        ])?;

        if let Some(reason) = reason {
            debug!(issue_id, %reason, "issue stolen");
        }
        Ok(StealOutcome {
            previous_claimant: claim.claimant.id.clone(),
            contest_window_ends_at: window,
            new_claim,
        })
    }

    /// Challenge a recent steal, within its contest window.
    pub fn contest(
        &self,
        issue_id: &str,
        contester_id: &str,
        reason: &str,
    ) -> CoordResult<ContestInfo> {
        let m = &self.manager;
        let _guard = m.locks.acquire(issue_id, m.op_timeout())?;

        let claim = m
            .store
            .active_claim(issue_id)
            .ok_or_else(|| CoordinatorError::NoActiveSteal {
                issue_id: issue_id.to_string(),
            })?;
        let origin = claim
            .steal_origin
            .as_ref()
            .ok_or_else(|| CoordinatorError::NoActiveSteal {
                issue_id: issue_id.to_string(),
            })?;
        let window_ends = origin.contest_window_ends_at.ok_or_else(|| {
            CoordinatorError::NoActiveSteal {
                issue_id: issue_id.to_string(),
            }
        })?;
        if claim
            .contest
            .as_ref()
            .is_some_and(|c| c.resolution.is_none())
        {
            return Err(CoordinatorError::ContestPending {
                issue_id: issue_id.to_string(),
            });
        }
        let now = m.clock.now();
        if now >= window_ends {
            return Err(CoordinatorError::WindowClosed {
                issue_id: issue_id.to_string(),
                closed_at: window_ends,
            });
        }
        if contester_id != origin.previous_claimant {
            return Err(CoordinatorError::NotEligibleContester {
                contester_id: contester_id.to_string(),
            });
        }

        let contest = ContestInfo {
            contest_id: m.ids.contest_id(),
            defender: claim.claimant.id.clone(),
            challenger: contester_id.to_string(),
            reason: reason.to_string(),
            started_at: now,
            ends_at: window_ends,
            resolution: None,
        };
        m.commit(vec![EventDraft::new(
            claim.claim_id.clone(),
            Some(issue_id.to_string()),
            EventPayload::ContestStarted {
                contest: contest.clone(),
            },
        )
        .correlated(contest.contest_id.clone())])?;
        Ok(contest)
    }

    /// Decide a pending contest.
    ///
    /// A win for the challenger reverses the steal: the current claim is
    /// released with cause `contest` and a fresh claim opens for the original
    /// claimant, carrying the current progress so no work is lost.
    pub fn resolve_contest(
        &self,
        contest_id: &str,
        winner: ContestResolution,
        resolver_id: Option<&str>,
    ) -> CoordResult<ContestOutcome> {
        let m = &self.manager;
        let contested = m
            .store
            .list_contested()
            .into_iter()
            .find(|c| {
                c.contest
                    .as_ref()
                    .is_some_and(|info| info.contest_id == contest_id)
            })
            .ok_or_else(|| {
                CoordinatorError::validation(format!(
                    "contest {} not found or already resolved",
                    contest_id
                ))
            })?;

        let issue_id = contested.issue_id.clone();
        let _guard = m.locks.acquire(&issue_id, m.op_timeout())?;

        // Re-read under the lock; the contest may have been resolved meanwhile
        let claim = m
            .store
            .active_claim(&issue_id)
            .filter(|c| c.claim_id == contested.claim_id)
            .ok_or_else(|| {
                CoordinatorError::Conflict {
                    message: format!("claim under contest {} changed during resolution", contest_id),
                }
            })?;
        let contest = claim
            .contest
            .clone()
            .filter(|c| c.contest_id == contest_id && c.resolution.is_none())
            .ok_or_else(|| {
                CoordinatorError::validation(format!(
                    "contest {} not found or already resolved",
                    contest_id
                ))
            })?;

        let mut drafts = Vec::new();
        let mut reinstated = None;

        match winner {
            ContestResolution::Upheld => {
                drafts.push(
                    EventDraft::new(
                        claim.claim_id.clone(),
                        Some(issue_id.clone()),
                        EventPayload::ContestResolved {
                            contest_id: contest_id.to_string(),
                            winner,
                            resolved_by: resolver_id.map(str::to_string),
                            reinstated_claim_id: None,
                        },
                    )
                    .correlated(contest_id),
                );
            }
            ContestResolution::Reversed => {
                // Recover the challenger's full identity from the stolen claim
                let challenger = m
                    .store
                    .get(
                        &claim
                            .steal_origin
                            .as_ref()
                            .map(|o| o.previous_claim_id.clone())
                            .unwrap_or_default(),
                    )
                    .map(|previous| previous.claimant)
                    .unwrap_or(Claimant {
                        id: contest.challenger.clone(),
                        kind: claim.claimant.kind,
                        agent_type: None,
                        capabilities: vec![],
                    });

                let now = m.clock.now();
                let config = m.config.get();
                let new_claim = Claim::open(
                    m.ids.claim_id(),
                    issue_id.clone(),
                    challenger,
                    claim.priority,
                    now,
                    config.default_expiration().map(|d| now + d),
                    claim.progress,
                    None,
                );

                drafts.push(
                    EventDraft::new(
                        claim.claim_id.clone(),
                        Some(issue_id.clone()),
                        EventPayload::ContestResolved {
                            contest_id: contest_id.to_string(),
                            winner,
                            resolved_by: resolver_id.map(str::to_string),
                            reinstated_claim_id: Some(new_claim.claim_id.clone()),
                        },
                    )
                    .correlated(contest_id),
                );
                drafts.push(
                    EventDraft::new(
                        claim.claim_id.clone(),
                        Some(issue_id.clone()),
                        EventPayload::ClaimReleased {
                            by: resolver_id.unwrap_or(&contest.challenger).to_string(),
                            cause: ReleaseCause::Contest,
                            reason: Some(format!("contest {} reversed the steal", contest_id)),
                        },
                    )
                    .correlated(contest_id),
                );
                drafts.push(
                    EventDraft::new(
                        new_claim.claim_id.clone(),
                        Some(issue_id.clone()),
                        EventPayload::ClaimCreated {
                            claim: new_claim.clone(),
                        },
                    )
                    .correlated(contest_id),
                );
                reinstated = Some(new_claim);
            }
        }

        m.commit(drafts)?;
        let current = match &reinstated {
            Some(claim) => claim.clone(),
            None => m.store.get(&claim.claim_id).expect("claim exists"),
        };
        Ok(ContestOutcome {
            resolution: winner,
            claim: current,
            reinstated,
        })
    }

    /// Stealable claims sorted for pickers: priority desc, marked earliest
    /// first, then claim id.
    pub fn list_stealable(
        &self,
        priority: Option<ClaimPriority>,
        limit: usize,
    ) -> Vec<Claim> {
        let mut claims: Vec<Claim> = self
            .manager
            .store
            .list_stealable()
            .into_iter()
            .filter(|c| priority.map_or(true, |p| c.priority == p))
            .collect();
        claims.sort_by(|a, b| {
            let marked = |c: &Claim| c.stealable.as_ref().map(|s| s.marked_at);
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| marked(a).cmp(&marked(b)))
                .then_with(|| a.claim_id.cmp(&b.claim_id))
        });
        if limit > 0 {
            claims.truncate(limit);
        }
        claims
    }

    /// Scanner pass: auto-mark stale, long-blocked, and overload candidates.
    ///
    /// Candidates age out oldest-activity-first. Returns the issues marked.
    pub fn run_auto_mark(&self) -> Vec<String> {
        let m = &self.manager;
        let config = m.config.get();
        let now = m.clock.now();
        let mut marked = Vec::new();

        let mut candidates: Vec<(Claim, StealableReason)> = Vec::new();
        for claim in m.store.list_status(ClaimStatus::Active) {
            if now - claim.last_activity_at >= config.stale_threshold() {
                candidates.push((claim, StealableReason::Stale));
            }
        }
        for claim in m.store.list_status(ClaimStatus::Blocked) {
            let blocked_at = claim
                .blocked
                .as_ref()
                .map(|b| b.blocked_at)
                .unwrap_or(claim.last_activity_at);
            if now - blocked_at >= config.blocked_threshold() {
                candidates.push((claim, StealableReason::Blocked));
            }
        }
        // Overloaded holders: their lowest-priority active claim
        for sample in m.load.snapshot() {
            if sample.active_claims <= config.overload_threshold as usize {
                continue;
            }
            let victim = m
                .store
                .claims_for(&sample.claimant_id)
                .into_iter()
                .filter(|c| c.status == ClaimStatus::Active)
                .max_by_key(|c| (c.priority.rank(), Reverse(c.claimed_at)));
            if let Some(claim) = victim {
                candidates.push((claim, StealableReason::Overloaded));
            }
        }

        candidates.sort_by_key(|(claim, _)| claim.last_activity_at);
        candidates.dedup_by_key(|(claim, _)| claim.claim_id.clone());

        for (candidate, reason) in candidates {
            let Ok(_guard) = m.locks.acquire(&candidate.issue_id, m.op_timeout()) else {
                continue;
            };
            // Re-read under the lock; the claim may have moved on
            let Some(claim) = m
                .store
                .active_claim(&candidate.issue_id)
                .filter(|c| c.claim_id == candidate.claim_id && c.status == candidate.status)
            else {
                continue;
            };
            match self.mark_locked(&claim, reason) {
                Ok(_) => marked.push(claim.issue_id.clone()),
                Err(err) => {
                    debug!(issue_id = %claim.issue_id, %err, "auto-mark skipped");
                }
            }
        }
        marked
    }

    /// Close contest windows whose deadline passed, in favor of defenders.
    ///
    /// Returns the number of contests auto-resolved.
    pub fn auto_resolve_expired(&self) -> usize {
        let m = &self.manager;
        let now = m.clock.now();
        let mut resolved = 0;
        for claim in m.store.list_contested() {
            let Some(contest) = claim.contest.as_ref() else {
                continue;
            };
            if contest.resolution.is_none() && now >= contest.ends_at {
                match self.resolve_contest(&contest.contest_id, ContestResolution::Upheld, None) {
                    Ok(_) => resolved += 1,
                    Err(err) => {
                        debug!(contest_id = %contest.contest_id, %err, "auto-resolve skipped")
                    }
                }
            }
        }
        resolved
    }
}
