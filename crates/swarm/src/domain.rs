//! Core domain types for claim coordination.
//!
//! This module defines the claim aggregate and its satellite records: statuses,
//! priorities, claimant identity, stealable/blocked/handoff/contest sub-records,
//! notes, and the status history. It also owns the legal-transition table and
//! the projection fold ([`Claim::apply_event`]) that turns an ordered event
//! stream back into the current claim state.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::events::{EventPayload, EventRecord};

/// Claim lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimStatus {
    /// Being actively worked
    Active,
    /// Work intentionally suspended by the holder
    Paused,
    /// Work cannot proceed (external dependency, missing input)
    Blocked,
    /// A handoff has been requested and awaits acceptance
    HandoffPending,
    /// Work finished, awaiting review
    ReviewRequested,
    /// Open for another worker to take over
    Stealable,
    /// Finished successfully (terminal)
    Completed,
    /// Given up by the holder (terminal)
    Released,
    /// Timed out (terminal)
    Expired,
    /// Taken over by another worker (terminal)
    Stolen,
}

impl ClaimStatus {
    /// Every status, in declaration order.
    pub const ALL: [ClaimStatus; 10] = [
        ClaimStatus::Active,
        ClaimStatus::Paused,
        ClaimStatus::Blocked,
        ClaimStatus::HandoffPending,
        ClaimStatus::ReviewRequested,
        ClaimStatus::Stealable,
        ClaimStatus::Completed,
        ClaimStatus::Released,
        ClaimStatus::Expired,
        ClaimStatus::Stolen,
    ];

    /// Check if this status has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClaimStatus::Completed
                | ClaimStatus::Released
                | ClaimStatus::Expired
                | ClaimStatus::Stolen
        )
    }

    /// Legal targets for a caller-driven status transition.
    ///
    /// Time-driven terminations (expiry) bypass this table; they apply to any
    /// non-terminal status.
    pub fn allowed_transitions(self) -> &'static [ClaimStatus] {
        use ClaimStatus::*;
        match self {
            Active => &[
                Paused,
                Blocked,
                HandoffPending,
                ReviewRequested,
                Stealable,
                Completed,
                Released,
            ],
            Paused => &[Active, Blocked, HandoffPending, Stealable, Completed, Released],
            Blocked => &[Active, Paused, Stealable, Completed, Released],
            HandoffPending => &[Active, Completed, Released],
            ReviewRequested => &[Active, Completed, Blocked],
            Stealable => &[Active, Completed, Stolen],
            Completed | Released | Expired | Stolen => &[],
        }
    }

    /// Check whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: ClaimStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Kebab-case name, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Active => "active",
            ClaimStatus::Paused => "paused",
            ClaimStatus::Blocked => "blocked",
            ClaimStatus::HandoffPending => "handoff-pending",
            ClaimStatus::ReviewRequested => "review-requested",
            ClaimStatus::Stealable => "stealable",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Released => "released",
            ClaimStatus::Expired => "expired",
            ClaimStatus::Stolen => "stolen",
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim priority, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl ClaimPriority {
    /// Ordinal rank; lower means more urgent.
    pub fn rank(self) -> u8 {
        match self {
            ClaimPriority::Critical => 0,
            ClaimPriority::High => 1,
            ClaimPriority::Medium => 2,
            ClaimPriority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClaimPriority::Critical => "critical",
            ClaimPriority::High => "high",
            ClaimPriority::Medium => "medium",
            ClaimPriority::Low => "low",
        }
    }
}

impl fmt::Display for ClaimPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of worker holding or requesting a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimantKind {
    Human,
    Agent,
}

/// Worker identity as recorded on a claim.
///
/// The coordinator does not authenticate claimants; whatever identity the
/// caller presents is recorded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Claimant {
    /// Claimant identifier (e.g. `agent:coder-1`, `human:alice`)
    pub id: String,
    pub kind: ClaimantKind,
    /// Specialization for agents (e.g. `coder`, `reviewer`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    /// Capability tags used for capability-aware rebalancing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Why a claim was opened to stealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum StealableReason {
    /// No activity past the stale threshold
    Stale,
    /// Blocked past the blocked threshold
    Blocked,
    /// Holder carries too many active claims
    Overloaded,
    /// Holder opted in explicitly
    Manual,
}

/// Stealable sub-record, present while a claim is open to stealing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StealableInfo {
    pub reason: StealableReason,
    pub marked_at: DateTime<Utc>,
    /// Stealing before this instant fails; never earlier than `marked_at`
    pub grace_period_ends_at: DateTime<Utc>,
    /// When set, only claims at least this urgent are worth stealing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_priority_to_steal: Option<ClaimPriority>,
    /// Whether a successful steal opens a contest window
    pub requires_contest: bool,
    /// Holder at marking time, recorded for contest eligibility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_claimant: Option<String>,
}

/// Blocked sub-record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockedInfo {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub blocked_at: DateTime<Utc>,
}

/// Why a handoff was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum HandoffReason {
    Blocked,
    ExpertiseNeeded,
    Capacity,
    Reassignment,
    Other,
}

/// A pending (or historical) request to transfer a claim cooperatively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRequest {
    pub handoff_id: String,
    pub issue_id: String,
    pub from_claimant: String,
    /// Requested recipient; `None` means any eligible worker may accept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_claimant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_kind: Option<ClaimantKind>,
    pub reason: HandoffReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Status to restore if the handoff is rejected or expires
    pub previous_status: ClaimStatus,
}

/// Who won a contested steal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ContestResolution {
    /// The steal stands; the current holder keeps the claim
    Upheld,
    /// The steal is reversed; the challenger is reinstated
    Reversed,
}

/// Contest sub-record, present once a steal has been challenged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContestInfo {
    pub contest_id: String,
    /// Current holder (the one who stole)
    pub defender: String,
    /// Displaced claimant challenging the steal
    pub challenger: String,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    /// Past this instant an undecided contest resolves for the defender
    pub ends_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ContestResolution>,
}

/// Provenance of a claim created by a steal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StealOrigin {
    pub previous_claim_id: String,
    pub previous_claimant: String,
    pub stolen_at: DateTime<Utc>,
    /// `None` when the marking did not require a contest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contest_window_ends_at: Option<DateTime<Utc>>,
}

/// Freeform note attached to a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub author: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// One entry of the ordered status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    /// `None` only for the initial entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ClaimStatus>,
    pub to: ClaimStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Why a claim was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseCause {
    /// Holder released explicitly
    Manual,
    /// Closed in favor of an accepted handoff
    Handoff,
    /// Reversed by a contest resolution
    Contest,
    /// Moved by a rebalance pass
    Rebalancing,
    /// Auto-released after prolonged inactivity
    Inactivity,
}

/// The claim aggregate: one worker's recognized right to work one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub claim_id: String,
    pub issue_id: String,
    pub claimant: Claimant,
    pub status: ClaimStatus,
    pub priority: ClaimPriority,
    pub claimed_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Completion estimate, 0-100, monotone within one claim id
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stealable: Option<StealableInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<BlockedInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contest: Option<ContestInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steal_origin: Option<StealOrigin>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
    pub status_history: Vec<StatusChange>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Claim {
    /// Create a fresh `active` claim with its initial history entry.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        claim_id: String,
        issue_id: String,
        claimant: Claimant,
        priority: ClaimPriority,
        claimed_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        progress: u8,
        steal_origin: Option<StealOrigin>,
    ) -> Self {
        let by = Some(claimant.id.clone());
        Self {
            claim_id,
            issue_id,
            claimant,
            status: ClaimStatus::Active,
            priority,
            claimed_at,
            last_activity_at: claimed_at,
            expires_at,
            progress,
            stealable: None,
            blocked: None,
            handoff: None,
            contest: None,
            steal_origin,
            notes: Vec::new(),
            status_history: vec![StatusChange {
                from: None,
                to: ClaimStatus::Active,
                at: claimed_at,
                by,
                note: None,
            }],
            metadata: HashMap::new(),
        }
    }

    /// Check if this claim has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn push_status(
        &mut self,
        to: ClaimStatus,
        at: DateTime<Utc>,
        by: Option<String>,
        note: Option<String>,
    ) {
        self.status_history.push(StatusChange {
            from: Some(self.status),
            to,
            at,
            by,
            note,
        });
        self.status = to;
        self.last_activity_at = at;
    }

    /// Fold one event into this claim.
    ///
    /// This is the single projection function: the live store and replay both
    /// go through it, which is what keeps the event log and the projection
    /// bit-for-bit consistent. Events for other aggregates are ignored.
    pub fn apply_event(&mut self, record: &EventRecord) {
        if record.aggregate_id != self.claim_id {
            return;
        }
        let at = record.timestamp;
        match &record.payload {
            EventPayload::ClaimCreated { claim } => {
                *self = claim.clone();
            }
            EventPayload::StatusChanged {
                from,
                to,
                by,
                note,
                blocked,
            } => {
                if *from == ClaimStatus::HandoffPending {
                    self.handoff = None;
                }
                self.push_status(*to, at, by.clone(), note.clone());
                match to {
                    ClaimStatus::Blocked => self.blocked = blocked.clone(),
                    ClaimStatus::Active | ClaimStatus::Paused => {
                        self.blocked = None;
                        self.stealable = None;
                    }
                    _ => {}
                }
            }
            EventPayload::ProgressUpdated { progress, .. } => {
                self.progress = *progress;
                self.last_activity_at = at;
            }
            EventPayload::NoteAdded { note } => {
                self.notes.push(note.clone());
                self.last_activity_at = at;
            }
            EventPayload::ClaimReleased { by, reason, .. } => {
                self.push_status(ClaimStatus::Released, at, Some(by.clone()), reason.clone());
            }
            EventPayload::ClaimCompleted { by } => {
                self.push_status(ClaimStatus::Completed, at, Some(by.clone()), None);
            }
            EventPayload::ClaimExpired { .. } => {
                self.push_status(ClaimStatus::Expired, at, None, None);
            }
            EventPayload::HandoffRequested { handoff } => {
                self.push_status(
                    ClaimStatus::HandoffPending,
                    at,
                    Some(handoff.from_claimant.clone()),
                    handoff.notes.clone(),
                );
                self.handoff = Some(handoff.clone());
            }
            EventPayload::HandoffAccepted { .. } => {
                // The release that closes this claim is its own event.
                self.last_activity_at = at;
            }
            EventPayload::HandoffRejected { reason, .. } => {
                let previous = self
                    .handoff
                    .as_ref()
                    .map(|h| h.previous_status)
                    .unwrap_or(ClaimStatus::Active);
                self.push_status(previous, at, None, reason.clone());
                self.handoff = None;
            }
            EventPayload::MarkedStealable { info } => {
                self.push_status(ClaimStatus::Stealable, at, info.original_claimant.clone(), None);
                self.stealable = Some(info.clone());
            }
            EventPayload::IssueStolen { stealer, .. } => {
                self.push_status(ClaimStatus::Stolen, at, Some(stealer.clone()), None);
            }
            EventPayload::ContestStarted { contest } => {
                self.contest = Some(contest.clone());
                self.last_activity_at = at;
            }
            EventPayload::ContestResolved { winner, .. } => {
                if let Some(contest) = self.contest.as_mut() {
                    contest.resolution = Some(*winner);
                }
            }
            EventPayload::SwarmRebalanced { .. } => {}
        }
    }

    /// Rebuild a claim from its ordered event stream.
    ///
    /// Returns `None` if the stream does not begin with a creation event.
    pub fn replay(records: &[EventRecord]) -> Option<Claim> {
        let mut iter = records.iter();
        let mut claim = match iter.next()?.payload {
            EventPayload::ClaimCreated { ref claim } => claim.clone(),
            _ => return None,
        };
        for record in iter {
            claim.apply_event(record);
        }
        Some(claim)
    }
}
