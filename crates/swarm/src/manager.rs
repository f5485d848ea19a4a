//! Claim lifecycle state machine.
//!
//! The manager owns every caller-driven lifecycle operation: claiming,
//! releasing, status updates, progress, notes, reviews, and handoffs, plus the
//! time-driven expiry and inactivity transitions fed to it by the expiry
//! driver. Each mutating operation runs inside the issue's critical section
//! and commits through one pipeline: append to the event log, fold into the
//! projection, adjust the load index, then publish on the bus.

use chrono::Duration;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::bus::EventBus;
use crate::catalog::{ClaimantDirectory, IssueCatalog, IssueRef};
use crate::clock::Clock;
use crate::config::SharedConfig;
use crate::domain::{
    BlockedInfo, Claim, ClaimPriority, ClaimStatus, Claimant, ClaimantKind, HandoffReason,
    HandoffRequest, Note, ReleaseCause,
};
use crate::errors::{CoordResult, CoordinatorError};
use crate::event_log::{EventDraft, EventLog};
use crate::events::{EventPayload, EventRecord, HistoryEntry};
use crate::ids::IdGen;
use crate::load::{LoadIndex, LoadSample};
use crate::locks::IssueLocks;
use crate::store::ClaimStore;

/// Grouped claims for the board query.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoardView {
    /// Group key -> claims (key depends on the grouping)
    pub groups: HashMap<String, Vec<Claim>>,
    /// Group key -> claim count
    pub counts: HashMap<String, usize>,
}

/// How to group the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum BoardGrouping {
    Claimant,
    Priority,
    Status,
}

/// Swarm-wide load overview.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadOverview {
    pub total_claimants: usize,
    pub total_active_claims: usize,
    pub overloaded_count: usize,
    pub underloaded_count: usize,
    pub samples: Vec<LoadSample>,
    /// Claimant ids currently overloaded
    pub bottlenecks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

/// Aggregated claim metrics over a time range.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimMetrics {
    pub claims_created: usize,
    pub claims_completed: usize,
    pub claims_released: usize,
    pub claims_expired: usize,
    pub claims_stolen: usize,
    pub contests_started: usize,
    /// Current non-terminal claims by status
    pub current_by_status: HashMap<String, usize>,
    /// Current non-terminal claims by priority
    pub current_by_priority: HashMap<String, usize>,
    /// Mean time from claim to completion, for completions in range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_completion_ms: Option<i64>,
    /// Mean claim lifetime for any terminal outcome in range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_lifetime_ms: Option<i64>,
}

/// Filter for the available-issue listing.
#[derive(Debug, Clone, Default)]
pub struct AvailableFilter {
    pub priority: Option<ClaimPriority>,
    pub labels: Vec<String>,
    pub repository: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Lifecycle state machine over the claim store.
pub struct ClaimManager {
    pub(crate) store: Arc<ClaimStore>,
    pub(crate) log: Arc<EventLog>,
    pub(crate) load: Arc<LoadIndex>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) locks: Arc<IssueLocks>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: IdGen,
    pub(crate) config: SharedConfig,
    pub(crate) catalog: Arc<dyn IssueCatalog>,
    pub(crate) directory: Arc<dyn ClaimantDirectory>,
    /// handoff id -> issue id, for accept/reject lookups
    handoffs: RwLock<HashMap<String, String>>,
}

impl ClaimManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ClaimStore>,
        log: Arc<EventLog>,
        load: Arc<LoadIndex>,
        bus: Arc<EventBus>,
        locks: Arc<IssueLocks>,
        clock: Arc<dyn Clock>,
        ids: IdGen,
        config: SharedConfig,
        catalog: Arc<dyn IssueCatalog>,
        directory: Arc<dyn ClaimantDirectory>,
    ) -> Self {
        // Re-index pending handoffs after a projection rebuild
        let mut handoffs = HashMap::new();
        for claim in store.list_status(ClaimStatus::HandoffPending) {
            if let Some(handoff) = &claim.handoff {
                handoffs.insert(handoff.handoff_id.clone(), claim.issue_id.clone());
            }
        }
        Self {
            store,
            log,
            load,
            bus,
            locks,
            clock,
            ids,
            config,
            catalog,
            directory,
            handoffs: RwLock::new(handoffs),
        }
    }

    /// Append, project, account, and publish a batch of event drafts.
    ///
    /// The batch is folded into the projection as one step, so multi-event
    /// operations (steal, handoff accept) never expose a half-applied state.
    /// Must be called while holding the critical section of every issue the
    /// drafts touch.
    pub(crate) fn commit(&self, drafts: Vec<EventDraft>) -> CoordResult<Vec<EventRecord>> {
        let mut records = Vec::with_capacity(drafts.len());
        for draft in drafts {
            records.push(self.log.append(draft)?);
        }

        // State before application, for load accounting and handoff cleanup
        let priors: Vec<Option<(String, ClaimantKind, ClaimStatus, Option<String>)>> = records
            .iter()
            .map(|r| {
                self.store.get(&r.aggregate_id).map(|c| {
                    (
                        c.claimant.id.clone(),
                        c.claimant.kind,
                        c.status,
                        c.handoff.as_ref().map(|h| h.handoff_id.clone()),
                    )
                })
            })
            .collect();

        self.store.apply_all(&records)?;

        for (record, prior) in records.iter().zip(&priors) {
            match (&record.payload, prior) {
                (EventPayload::SwarmRebalanced { .. }, _) => {}
                (EventPayload::ClaimCreated { claim }, _) => {
                    self.load
                        .on_transition(&claim.claimant.id, claim.claimant.kind, None, claim.status);
                }
                (_, Some((claimant_id, kind, from, pending_handoff))) => {
                    if let Some(to) = self.store.get(&record.aggregate_id).map(|c| c.status) {
                        if to != *from {
                            self.load.on_transition(claimant_id, *kind, Some(*from), to);
                        }
                        // A claim leaving handoff-pending by any route retires
                        // its handoff id
                        if *from == ClaimStatus::HandoffPending
                            && to != ClaimStatus::HandoffPending
                        {
                            if let Some(handoff_id) = pending_handoff {
                                self.handoffs.write().unwrap().remove(handoff_id);
                            }
                        }
                    }
                }
                (_, None) => {}
            }
        }

        for record in &records {
            self.bus.publish(record);
        }
        Ok(records)
    }

    pub(crate) fn op_timeout(&self) -> std::time::Duration {
        self.config.get().op_timeout()
    }

    /// Resolve the claimant identity recorded on new claims, enriching the
    /// caller-supplied identity from the directory where the caller was
    /// silent.
    pub(crate) fn resolve_claimant(&self, claimant: Claimant) -> Claimant {
        match self.directory.get(&claimant.id) {
            Some(profile) => Claimant {
                agent_type: claimant.agent_type.or(profile.agent_type),
                capabilities: if claimant.capabilities.is_empty() {
                    profile.capabilities
                } else {
                    claimant.capabilities
                },
                ..claimant
            },
            None => claimant,
        }
    }

    pub(crate) fn check_capacity(&self, claimant_id: &str) -> CoordResult<()> {
        let max = self.load.max_claims_for(claimant_id);
        let held = self.load.non_terminal(claimant_id);
        if held >= max as usize {
            return Err(CoordinatorError::MaxClaimsExceeded {
                claimant_id: claimant_id.to_string(),
                active: held,
                max,
            });
        }
        Ok(())
    }

    pub(crate) fn owned_active_claim(&self, issue_id: &str, claimant_id: &str) -> CoordResult<Claim> {
        let claim = self
            .store
            .active_claim(issue_id)
            .ok_or_else(|| CoordinatorError::NotClaimed {
                issue_id: issue_id.to_string(),
            })?;
        if claim.claimant.id != claimant_id {
            return Err(CoordinatorError::NotOwner {
                issue_id: issue_id.to_string(),
                owner: claim.claimant.id,
                caller: claimant_id.to_string(),
            });
        }
        Ok(claim)
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Open a claim on an issue.
    ///
    /// # Errors
    ///
    /// - `UnknownIssue` if the catalogue does not know the issue
    /// - `AlreadyClaimed` if another non-terminal claim exists
    /// - `MaxClaimsExceeded` if the claimant is at capacity
    pub fn claim(
        &self,
        issue_id: &str,
        claimant: Claimant,
        priority: Option<ClaimPriority>,
        ttl_ms: Option<u64>,
    ) -> CoordResult<Claim> {
        let issue = self
            .catalog
            .get(issue_id)
            .ok_or_else(|| CoordinatorError::UnknownIssue {
                issue_id: issue_id.to_string(),
            })?;
        let claimant = self.resolve_claimant(claimant);

        let _guard = self.locks.acquire(issue_id, self.op_timeout())?;

        if let Some(existing) = self.store.active_claim(issue_id) {
            return Err(CoordinatorError::AlreadyClaimed {
                issue_id: issue_id.to_string(),
                claimant_id: existing.claimant.id,
            });
        }
        self.check_capacity(&claimant.id)?;

        let now = self.clock.now();
        let config = self.config.get();
        let ttl = ttl_ms
            .map(|ms| Duration::milliseconds(ms as i64))
            .or_else(|| config.default_expiration());
        let claim = Claim::open(
            self.ids.claim_id(),
            issue_id.to_string(),
            claimant,
            priority.unwrap_or(issue.priority),
            now,
            ttl.map(|d| now + d),
            0,
            None,
        );

        self.commit(vec![EventDraft::new(
            claim.claim_id.clone(),
            Some(issue_id.to_string()),
            EventPayload::ClaimCreated {
                claim: claim.clone(),
            },
        )])?;
        Ok(claim)
    }

    /// Release a claim explicitly.
    pub fn release(
        &self,
        issue_id: &str,
        claimant_id: &str,
        reason: Option<String>,
    ) -> CoordResult<Claim> {
        let _guard = self.locks.acquire(issue_id, self.op_timeout())?;
        let claim = self.owned_active_claim(issue_id, claimant_id)?;
        if !claim.status.can_transition_to(ClaimStatus::Released) {
            return Err(CoordinatorError::InvalidTransition {
                from: claim.status,
                to: ClaimStatus::Released,
            });
        }

        self.commit(vec![EventDraft::new(
            claim.claim_id.clone(),
            Some(issue_id.to_string()),
            EventPayload::ClaimReleased {
                by: claimant_id.to_string(),
                cause: ReleaseCause::Manual,
                reason,
            },
        )])?;
        Ok(self.store.get(&claim.claim_id).expect("claim just released"))
    }

    /// Caller-driven status transition.
    ///
    /// Stealable marking, handoffs, steals, and expiry have dedicated
    /// operations; requesting those statuses here is a validation error.
    pub fn update_status(
        &self,
        issue_id: &str,
        claimant_id: &str,
        new_status: ClaimStatus,
        note: Option<String>,
        progress: Option<u8>,
    ) -> CoordResult<Claim> {
        let _guard = self.locks.acquire(issue_id, self.op_timeout())?;
        let claim = self.owned_active_claim(issue_id, claimant_id)?;

        if matches!(
            new_status,
            ClaimStatus::Stealable
                | ClaimStatus::Stolen
                | ClaimStatus::Expired
                | ClaimStatus::HandoffPending
        ) {
            return Err(CoordinatorError::validation(format!(
                "status {} is set through its dedicated operation",
                new_status
            )));
        }
        if !claim.status.can_transition_to(new_status) {
            return Err(CoordinatorError::InvalidTransition {
                from: claim.status,
                to: new_status,
            });
        }

        let mut drafts = Vec::new();
        if let Some(progress) = progress {
            self.validate_progress(&claim, progress)?;
            if progress != claim.progress {
                drafts.push(EventDraft::new(
                    claim.claim_id.clone(),
                    Some(issue_id.to_string()),
                    EventPayload::ProgressUpdated {
                        progress,
                        by: claimant_id.to_string(),
                    },
                ));
            }
        }

        let payload = match new_status {
            ClaimStatus::Completed => EventPayload::ClaimCompleted {
                by: claimant_id.to_string(),
            },
            ClaimStatus::Released => EventPayload::ClaimReleased {
                by: claimant_id.to_string(),
                cause: ReleaseCause::Manual,
                reason: note.clone(),
            },
            ClaimStatus::Blocked => EventPayload::StatusChanged {
                from: claim.status,
                to: new_status,
                by: Some(claimant_id.to_string()),
                note: note.clone(),
                blocked: Some(BlockedInfo {
                    reason: note.unwrap_or_else(|| "unspecified".to_string()),
                    description: None,
                    blocked_at: self.clock.now(),
                }),
            },
            _ => EventPayload::StatusChanged {
                from: claim.status,
                to: new_status,
                by: Some(claimant_id.to_string()),
                note,
                blocked: None,
            },
        };
        drafts.push(EventDraft::new(
            claim.claim_id.clone(),
            Some(issue_id.to_string()),
            payload,
        ));

        self.commit(drafts)?;
        Ok(self.store.get(&claim.claim_id).expect("claim just updated"))
    }

    fn validate_progress(&self, claim: &Claim, progress: u8) -> CoordResult<()> {
        if progress > 100 {
            return Err(CoordinatorError::validation(
                "progress must be within 0-100",
            ));
        }
        if progress < claim.progress {
            return Err(CoordinatorError::validation(format!(
                "progress cannot decrease ({} -> {})",
                claim.progress, progress
            )));
        }
        Ok(())
    }

    /// Monotone progress update on the issue's active claim.
    pub fn set_progress(
        &self,
        issue_id: &str,
        claimant_id: &str,
        progress: u8,
    ) -> CoordResult<Claim> {
        let _guard = self.locks.acquire(issue_id, self.op_timeout())?;
        let claim = self.owned_active_claim(issue_id, claimant_id)?;
        self.validate_progress(&claim, progress)?;

        if progress != claim.progress {
            self.commit(vec![EventDraft::new(
                claim.claim_id.clone(),
                Some(issue_id.to_string()),
                EventPayload::ProgressUpdated {
                    progress,
                    by: claimant_id.to_string(),
                },
            )])?;
        }
        Ok(self.store.get(&claim.claim_id).expect("claim exists"))
    }

    /// Attach a note to the issue's active claim. Any author may note.
    pub fn add_note(&self, issue_id: &str, author: &str, text: &str) -> CoordResult<Claim> {
        let _guard = self.locks.acquire(issue_id, self.op_timeout())?;
        let claim = self
            .store
            .active_claim(issue_id)
            .ok_or_else(|| CoordinatorError::NotClaimed {
                issue_id: issue_id.to_string(),
            })?;

        self.commit(vec![EventDraft::new(
            claim.claim_id.clone(),
            Some(issue_id.to_string()),
            EventPayload::NoteAdded {
                note: Note {
                    author: author.to_string(),
                    text: text.to_string(),
                    at: self.clock.now(),
                },
            },
        )])?;
        Ok(self.store.get(&claim.claim_id).expect("claim exists"))
    }

    /// Ask for review on the issue's active claim.
    pub fn request_review(
        &self,
        issue_id: &str,
        claimant_id: &str,
        note: Option<String>,
    ) -> CoordResult<Claim> {
        self.update_status(
            issue_id,
            claimant_id,
            ClaimStatus::ReviewRequested,
            note,
            None,
        )
    }

    /// Finish a review: approve to complete, reject back to active.
    pub fn complete_review(
        &self,
        issue_id: &str,
        reviewer_id: &str,
        approved: bool,
        note: Option<String>,
    ) -> CoordResult<Claim> {
        let _guard = self.locks.acquire(issue_id, self.op_timeout())?;
        let claim = self
            .store
            .active_claim(issue_id)
            .ok_or_else(|| CoordinatorError::NotClaimed {
                issue_id: issue_id.to_string(),
            })?;
        if claim.status != ClaimStatus::ReviewRequested {
            return Err(CoordinatorError::InvalidTransition {
                from: claim.status,
                to: if approved {
                    ClaimStatus::Completed
                } else {
                    ClaimStatus::Active
                },
            });
        }

        let payload = if approved {
            EventPayload::ClaimCompleted {
                by: reviewer_id.to_string(),
            }
        } else {
            EventPayload::StatusChanged {
                from: claim.status,
                to: ClaimStatus::Active,
                by: Some(reviewer_id.to_string()),
                note,
                blocked: None,
            }
        };
        self.commit(vec![EventDraft::new(
            claim.claim_id.clone(),
            Some(issue_id.to_string()),
            payload,
        )])?;
        Ok(self.store.get(&claim.claim_id).expect("claim exists"))
    }

    // ------------------------------------------------------------------
    // Handoffs
    // ------------------------------------------------------------------

    /// Request a cooperative transfer of the issue's active claim.
    ///
    /// `to_claimant = None` leaves the handoff open for any eligible worker.
    #[allow(clippy::too_many_arguments)]
    pub fn request_handoff(
        &self,
        issue_id: &str,
        from_id: &str,
        to_claimant: Option<String>,
        to_kind: Option<ClaimantKind>,
        reason: HandoffReason,
        notes: Option<String>,
    ) -> CoordResult<HandoffRequest> {
        let _guard = self.locks.acquire(issue_id, self.op_timeout())?;
        let claim = self.owned_active_claim(issue_id, from_id)?;
        if !claim.status.can_transition_to(ClaimStatus::HandoffPending) {
            return Err(CoordinatorError::InvalidTransition {
                from: claim.status,
                to: ClaimStatus::HandoffPending,
            });
        }

        let now = self.clock.now();
        let handoff = HandoffRequest {
            handoff_id: self.ids.handoff_id(),
            issue_id: issue_id.to_string(),
            from_claimant: from_id.to_string(),
            to_claimant,
            to_kind,
            reason,
            notes,
            requested_at: now,
            expires_at: self.config.get().default_expiration().map(|d| now + d),
            previous_status: claim.status,
        };

        self.commit(vec![EventDraft::new(
            claim.claim_id.clone(),
            Some(issue_id.to_string()),
            EventPayload::HandoffRequested {
                handoff: handoff.clone(),
            },
        )])?;
        self.handoffs
            .write()
            .unwrap()
            .insert(handoff.handoff_id.clone(), issue_id.to_string());
        Ok(handoff)
    }

    fn pending_handoff(&self, handoff_id: &str) -> CoordResult<(String, Claim, HandoffRequest)> {
        let issue_id = self
            .handoffs
            .read()
            .unwrap()
            .get(handoff_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::HandoffNotFound {
                handoff_id: handoff_id.to_string(),
            })?;
        let claim = self.store.active_claim(&issue_id).ok_or_else(|| {
            CoordinatorError::HandoffNotFound {
                handoff_id: handoff_id.to_string(),
            }
        })?;
        let handoff = claim
            .handoff
            .clone()
            .filter(|h| h.handoff_id == handoff_id)
            .ok_or_else(|| CoordinatorError::HandoffNotFound {
                handoff_id: handoff_id.to_string(),
            })?;
        if claim.status != ClaimStatus::HandoffPending {
            return Err(CoordinatorError::HandoffNotFound {
                handoff_id: handoff_id.to_string(),
            });
        }
        Ok((issue_id, claim, handoff))
    }

    /// Accept a pending handoff, closing the old claim and opening a fresh
    /// one for the acceptor with progress and priority carried over.
    pub fn accept_handoff(&self, handoff_id: &str, acceptor: Claimant) -> CoordResult<Claim> {
        let issue_id = self
            .handoffs
            .read()
            .unwrap()
            .get(handoff_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::HandoffNotFound {
                handoff_id: handoff_id.to_string(),
            })?;
        let _guard = self.locks.acquire(&issue_id, self.op_timeout())?;
        let (_, claim, handoff) = self.pending_handoff(handoff_id)?;

        let now = self.clock.now();
        if handoff.expires_at.is_some_and(|at| now >= at) {
            return Err(CoordinatorError::validation(format!(
                "handoff {} expired at {}",
                handoff_id,
                handoff.expires_at.unwrap()
            )));
        }
        let acceptor = self.resolve_claimant(acceptor);
        if acceptor.id == handoff.from_claimant {
            return Err(CoordinatorError::validation(
                "a handoff cannot be accepted by its requester",
            ));
        }
        if let Some(target) = &handoff.to_claimant {
            if target != &acceptor.id {
                return Err(CoordinatorError::validation(format!(
                    "handoff {} is directed to {}",
                    handoff_id, target
                )));
            }
        }
        if let Some(kind) = handoff.to_kind {
            if kind != acceptor.kind {
                return Err(CoordinatorError::validation(format!(
                    "handoff {} requires a {:?} claimant",
                    handoff_id, kind
                )));
            }
        }
        self.check_capacity(&acceptor.id)?;

        let config = self.config.get();
        let new_claim = Claim::open(
            self.ids.claim_id(),
            issue_id.clone(),
            acceptor.clone(),
            claim.priority,
            now,
            config.default_expiration().map(|d| now + d),
            claim.progress,
            None,
        );

        self.commit(vec![
            EventDraft::new(
                claim.claim_id.clone(),
                Some(issue_id.clone()),
                EventPayload::HandoffAccepted {
                    handoff_id: handoff_id.to_string(),
                    accepted_by: acceptor.id.clone(),
                    new_claim_id: new_claim.claim_id.clone(),
                },
            )
            .correlated(handoff_id),
            EventDraft::new(
                claim.claim_id.clone(),
                Some(issue_id.clone()),
                EventPayload::ClaimReleased {
                    by: handoff.from_claimant.clone(),
                    cause: ReleaseCause::Handoff,
                    reason: Some(format!("handed off to {}", acceptor.id)),
                },
            )
            .correlated(handoff_id),
            EventDraft::new(
                new_claim.claim_id.clone(),
                Some(issue_id.clone()),
                EventPayload::ClaimCreated {
                    claim: new_claim.clone(),
                },
            )
            .correlated(handoff_id),
        ])?;
        self.handoffs.write().unwrap().remove(handoff_id);
        Ok(new_claim)
    }

    /// Reject (or cancel) a pending handoff, restoring the prior status.
    pub fn reject_handoff(&self, handoff_id: &str, reason: Option<String>) -> CoordResult<Claim> {
        let issue_id = self
            .handoffs
            .read()
            .unwrap()
            .get(handoff_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::HandoffNotFound {
                handoff_id: handoff_id.to_string(),
            })?;
        let _guard = self.locks.acquire(&issue_id, self.op_timeout())?;
        let (_, claim, _) = self.pending_handoff(handoff_id)?;

        self.commit(vec![EventDraft::new(
            claim.claim_id.clone(),
            Some(issue_id),
            EventPayload::HandoffRejected {
                handoff_id: handoff_id.to_string(),
                reason,
            },
        )])?;
        self.handoffs.write().unwrap().remove(handoff_id);
        Ok(self.store.get(&claim.claim_id).expect("claim exists"))
    }

    // ------------------------------------------------------------------
    // Time-driven transitions (fed by the expiry driver)
    // ------------------------------------------------------------------

    /// Expire the issue's claim if its deadline has passed.
    ///
    /// Claims with a pending contest, or still inside a post-steal contest
    /// window, are protected and skipped. Returns `None` when the claim was
    /// not (or no longer) expirable.
    pub fn expire_claim(&self, issue_id: &str) -> CoordResult<Option<Claim>> {
        let _guard = self.locks.acquire(issue_id, self.op_timeout())?;
        let claim = match self.store.active_claim(issue_id) {
            Some(claim) => claim,
            None => return Ok(None),
        };
        let now = self.clock.now();
        let deadline = match claim.expires_at {
            Some(at) if now >= at => at,
            _ => return Ok(None),
        };
        let contest_pending = claim
            .contest
            .as_ref()
            .is_some_and(|c| c.resolution.is_none());
        let window_open = claim
            .steal_origin
            .as_ref()
            .and_then(|o| o.contest_window_ends_at)
            .is_some_and(|at| now < at);
        if contest_pending || window_open {
            debug!(issue_id, "expiry skipped: claim under contest protection");
            return Ok(None);
        }

        self.commit(vec![EventDraft::new(
            claim.claim_id.clone(),
            Some(issue_id.to_string()),
            EventPayload::ClaimExpired {
                expired_after: deadline,
            },
        )])?;
        Ok(Some(
            self.store.get(&claim.claim_id).expect("claim just expired"),
        ))
    }

    /// Auto-release the issue's claim if it has been idle past the
    /// configured inactivity threshold. Disabled when the threshold is 0.
    pub fn release_inactive(&self, issue_id: &str) -> CoordResult<Option<Claim>> {
        let threshold_ms = self.config.get().auto_release_on_inactivity_ms;
        if threshold_ms == 0 {
            return Ok(None);
        }
        let _guard = self.locks.acquire(issue_id, self.op_timeout())?;
        let claim = match self.store.active_claim(issue_id) {
            Some(claim) => claim,
            None => return Ok(None),
        };
        let now = self.clock.now();
        let idle_since = claim.last_activity_at + Duration::milliseconds(threshold_ms as i64);
        if claim.status != ClaimStatus::Active || now < idle_since {
            return Ok(None);
        }

        self.commit(vec![EventDraft::new(
            claim.claim_id.clone(),
            Some(issue_id.to_string()),
            EventPayload::ClaimReleased {
                by: claim.claimant.id.clone(),
                cause: ReleaseCause::Inactivity,
                reason: Some(format!("no activity since {}", claim.last_activity_at)),
            },
        )])?;
        Ok(Some(
            self.store.get(&claim.claim_id).expect("claim just released"),
        ))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Issues with no non-terminal claim, filtered and paginated.
    ///
    /// Returns the page and the total match count before pagination.
    pub fn list_available(&self, filter: &AvailableFilter) -> (Vec<IssueRef>, usize) {
        let claimed = self.store.claimed_issues();
        let mut issues: Vec<IssueRef> = self
            .catalog
            .list()
            .into_iter()
            .filter(|issue| !claimed.contains(&issue.issue_id))
            .filter(|issue| filter.priority.map_or(true, |p| issue.priority == p))
            .filter(|issue| {
                filter
                    .labels
                    .iter()
                    .all(|label| issue.labels.contains(label))
            })
            .filter(|issue| {
                filter
                    .repository
                    .as_ref()
                    .map_or(true, |repo| issue.repository.as_ref() == Some(repo))
            })
            .collect();
        issues.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| a.issue_id.cmp(&b.issue_id))
        });

        let total = issues.len();
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let page = issues
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect();
        (page, total)
    }

    /// A claimant's claims, newest first, paginated.
    ///
    /// Without a status filter only non-terminal claims are listed; with one,
    /// terminal statuses can be queried too.
    pub fn list_mine(
        &self,
        claimant_id: &str,
        status: Option<ClaimStatus>,
        limit: usize,
        offset: usize,
    ) -> (Vec<Claim>, usize) {
        let mut claims = match status {
            Some(status) => self.store.history_for(claimant_id, Some(status)),
            None => self.store.claims_for(claimant_id),
        };
        claims.sort_by(|a, b| b.claimed_at.cmp(&a.claimed_at));

        let total = claims.len();
        let limit = if limit == 0 { 50 } else { limit };
        (claims.into_iter().skip(offset).take(limit).collect(), total)
    }

    /// All non-terminal claims grouped for display.
    pub fn board(
        &self,
        include_agents: bool,
        include_humans: bool,
        group_by: BoardGrouping,
    ) -> BoardView {
        let mut groups: HashMap<String, Vec<Claim>> = HashMap::new();
        for claim in self.store.non_terminal() {
            let included = match claim.claimant.kind {
                ClaimantKind::Agent => include_agents,
                ClaimantKind::Human => include_humans,
            };
            if !included {
                continue;
            }
            let key = match group_by {
                BoardGrouping::Claimant => claim.claimant.id.clone(),
                BoardGrouping::Priority => claim.priority.as_str().to_string(),
                BoardGrouping::Status => claim.status.as_str().to_string(),
            };
            groups.entry(key).or_default().push(claim);
        }
        for claims in groups.values_mut() {
            claims.sort_by(|a, b| a.claimed_at.cmp(&b.claimed_at));
        }
        let counts = groups
            .iter()
            .map(|(key, claims)| (key.clone(), claims.len()))
            .collect();
        BoardView { groups, counts }
    }

    /// Ordered event history of an issue (most recent `limit` entries).
    pub fn history(&self, issue_id: &str, limit: usize) -> Vec<HistoryEntry> {
        let records = self.log.by_issue(issue_id);
        let limit = if limit == 0 { records.len() } else { limit };
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).map(HistoryEntry::from).collect()
    }

    /// Swarm-wide load overview with optional recommendations.
    pub fn load_overview(&self, include_recommendations: bool) -> LoadOverview {
        let samples = self.load.snapshot();
        let config = self.config.get();
        let bottlenecks: Vec<String> = samples
            .iter()
            .filter(|s| s.overloaded)
            .map(|s| s.claimant_id.clone())
            .collect();
        let mut recommendations = Vec::new();
        if include_recommendations {
            let max = samples.iter().map(|s| s.load_percentage).max().unwrap_or(0);
            let min = samples.iter().map(|s| s.load_percentage).min().unwrap_or(0);
            if !bottlenecks.is_empty() && max.saturating_sub(min) >= config.rebalance_spread_trigger
            {
                recommendations.push(format!(
                    "load spread is {} points; a rebalance pass would relieve {}",
                    max - min,
                    bottlenecks.join(", ")
                ));
            }
            for sample in &samples {
                if sample.active_claims > config.overload_threshold as usize {
                    recommendations.push(format!(
                        "{} holds {} active claims (threshold {}); lowest-priority work is eligible for steal marking",
                        sample.claimant_id, sample.active_claims, config.overload_threshold
                    ));
                }
            }
        }
        LoadOverview {
            total_claimants: samples.len(),
            total_active_claims: samples.iter().map(|s| s.active_claims).sum(),
            overloaded_count: bottlenecks.len(),
            underloaded_count: samples.iter().filter(|s| s.underloaded).count(),
            samples,
            bottlenecks,
            recommendations,
        }
    }

    /// Aggregated metrics over a trailing window (`None` = all time).
    pub fn metrics(&self, window: Option<Duration>) -> ClaimMetrics {
        let now = self.clock.now();
        let range = window.map(|d| (now - d, now));

        let count = |kind: &str| self.log.by_type(kind, range).len();
        let terminal_records: Vec<EventRecord> = ["claim:completed", "claim:released", "claim:expired"]
            .iter()
            .flat_map(|kind| self.log.by_type(kind, range))
            .collect();

        let mut completion_spans = Vec::new();
        let mut lifetime_spans = Vec::new();
        for record in &terminal_records {
            if let Some(claim) = self.store.get(&record.aggregate_id) {
                let span = (record.timestamp - claim.claimed_at).num_milliseconds();
                lifetime_spans.push(span);
                if record.kind() == "claim:completed" {
                    completion_spans.push(span);
                }
            }
        }
        let avg = |spans: &[i64]| {
            (!spans.is_empty()).then(|| spans.iter().sum::<i64>() / spans.len() as i64)
        };

        let mut current_by_status: HashMap<String, usize> = HashMap::new();
        let mut current_by_priority: HashMap<String, usize> = HashMap::new();
        for claim in self.store.non_terminal() {
            *current_by_status
                .entry(claim.status.as_str().to_string())
                .or_default() += 1;
            *current_by_priority
                .entry(claim.priority.as_str().to_string())
                .or_default() += 1;
        }

        ClaimMetrics {
            claims_created: count("claim:created"),
            claims_completed: count("claim:completed"),
            claims_released: count("claim:released"),
            claims_expired: count("claim:expired"),
            claims_stolen: count("steal:issue-stolen"),
            contests_started: count("steal:contest-started"),
            current_by_status,
            current_by_priority,
            avg_completion_ms: avg(&completion_spans),
            avg_lifetime_ms: avg(&lifetime_spans),
        }
    }
}
