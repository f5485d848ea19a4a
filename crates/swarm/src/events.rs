//! Event envelope and typed payloads for the append-only log.
//!
//! Every caller-observable state change is recorded as exactly one
//! [`EventRecord`]. The envelope carries the aggregate id, the per-aggregate
//! version assigned by the log, and optional causation/correlation links; the
//! payload is a tagged enum so handling stays exhaustive at compile time.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::domain::{
    BlockedInfo, Claim, ClaimStatus, ContestInfo, ContestResolution, HandoffRequest, Note,
    ReleaseCause, StealableInfo, StatusChange,
};
use crate::load::LoadSample;

/// Aggregate id used for swarm-wide events such as rebalance passes.
pub const SWARM_AGGREGATE: &str = "swarm";

/// A committed event: envelope plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Unique event identifier
    pub id: String,
    /// Aggregate this event belongs to (a claim id, or [`SWARM_AGGREGATE`])
    pub aggregate_id: String,
    /// Strictly increasing, gap-free per aggregate, starting at 1
    pub version: u64,
    /// Issue the event concerns, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Event that directly caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Id linking events of one logical operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl EventRecord {
    /// Stable kind string of the payload (e.g. `claim:created`).
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    /// A fresh claim was opened (by claim, steal, handoff accept, or rebalance)
    #[serde(rename = "claim:created")]
    ClaimCreated {
        /// Full snapshot of the claim at creation
        claim: Claim,
    },
    /// A non-terminal status transition
    #[serde(rename = "claim:status-changed")]
    StatusChanged {
        from: ClaimStatus,
        to: ClaimStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
        /// Present when `to` is `blocked`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocked: Option<BlockedInfo>,
    },
    #[serde(rename = "claim:progress-updated")]
    ProgressUpdated { progress: u8, by: String },
    #[serde(rename = "claim:note-added")]
    NoteAdded { note: Note },
    #[serde(rename = "claim:released")]
    ClaimReleased {
        by: String,
        cause: ReleaseCause,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "claim:completed")]
    ClaimCompleted { by: String },
    #[serde(rename = "claim:expired")]
    ClaimExpired {
        /// The deadline that passed
        expired_after: DateTime<Utc>,
    },
    #[serde(rename = "claim:handoff-requested")]
    HandoffRequested { handoff: HandoffRequest },
    #[serde(rename = "claim:handoff-accepted")]
    HandoffAccepted {
        handoff_id: String,
        accepted_by: String,
        new_claim_id: String,
    },
    #[serde(rename = "claim:handoff-rejected")]
    HandoffRejected {
        handoff_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "steal:issue-marked-stealable")]
    MarkedStealable { info: StealableInfo },
    #[serde(rename = "steal:issue-stolen")]
    IssueStolen {
        new_claim_id: String,
        stealer: String,
        previous_claimant: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contest_window_ends_at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "steal:contest-started")]
    ContestStarted { contest: ContestInfo },
    #[serde(rename = "steal:contest-resolved")]
    ContestResolved {
        contest_id: String,
        winner: ContestResolution,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolved_by: Option<String>,
        /// Claim opened for the challenger when the steal was reversed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reinstated_claim_id: Option<String>,
    },
    /// A rebalance pass was applied
    #[serde(rename = "swarm:rebalanced")]
    SwarmRebalanced {
        strategy: String,
        moves_planned: usize,
        moves_applied: usize,
        before: Vec<LoadSample>,
        after: Vec<LoadSample>,
    },
}

impl EventPayload {
    /// Stable kind string (the serialized `type` tag).
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::ClaimCreated { .. } => "claim:created",
            EventPayload::StatusChanged { .. } => "claim:status-changed",
            EventPayload::ProgressUpdated { .. } => "claim:progress-updated",
            EventPayload::NoteAdded { .. } => "claim:note-added",
            EventPayload::ClaimReleased { .. } => "claim:released",
            EventPayload::ClaimCompleted { .. } => "claim:completed",
            EventPayload::ClaimExpired { .. } => "claim:expired",
            EventPayload::HandoffRequested { .. } => "claim:handoff-requested",
            EventPayload::HandoffAccepted { .. } => "claim:handoff-accepted",
            EventPayload::HandoffRejected { .. } => "claim:handoff-rejected",
            EventPayload::MarkedStealable { .. } => "steal:issue-marked-stealable",
            EventPayload::IssueStolen { .. } => "steal:issue-stolen",
            EventPayload::ContestStarted { .. } => "steal:contest-started",
            EventPayload::ContestResolved { .. } => "steal:contest-resolved",
            EventPayload::SwarmRebalanced { .. } => "swarm:rebalanced",
        }
    }
}

/// Compact history entry derived from an event, for `claim_history` queries.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub event_id: String,
    pub claim_id: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusChange>,
}

impl From<&EventRecord> for HistoryEntry {
    fn from(record: &EventRecord) -> Self {
        let status = match &record.payload {
            EventPayload::StatusChanged {
                from, to, by, note, ..
            } => Some(StatusChange {
                from: Some(*from),
                to: *to,
                at: record.timestamp,
                by: by.clone(),
                note: note.clone(),
            }),
            _ => None,
        };
        Self {
            event_id: record.id.clone(),
            claim_id: record.aggregate_id.clone(),
            version: record.version,
            timestamp: record.timestamp,
            kind: record.kind().to_string(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimPriority, Claimant, ClaimantKind};

    fn sample_claim() -> Claim {
        Claim::open(
            "claim-evt".to_string(),
            "issue-evt".to_string(),
            Claimant {
                id: "agent:a1".to_string(),
                kind: ClaimantKind::Agent,
                agent_type: None,
                capabilities: vec![],
            },
            ClaimPriority::High,
            Utc::now(),
            None,
            0,
            None,
        )
    }

    #[test]
    fn payload_kind_matches_serialized_tag() {
        let payload = EventPayload::ClaimCompleted {
            by: "agent:a1".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], payload.kind());
    }

    #[test]
    fn record_roundtrips_through_json() {
        let record = EventRecord {
            id: "evt-1".to_string(),
            aggregate_id: "claim-evt".to_string(),
            version: 1,
            issue_id: Some("issue-evt".to_string()),
            timestamp: Utc::now(),
            causation_id: None,
            correlation_id: Some("op-1".to_string()),
            payload: EventPayload::ClaimCreated {
                claim: sample_claim(),
            },
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.kind(), "claim:created");
    }

    #[test]
    fn steal_events_use_namespaced_kinds() {
        let payload = EventPayload::MarkedStealable {
            info: StealableInfo {
                reason: crate::domain::StealableReason::Manual,
                marked_at: Utc::now(),
                grace_period_ends_at: Utc::now(),
                min_priority_to_steal: None,
                requires_contest: true,
                original_claimant: Some("agent:a1".to_string()),
            },
        };
        assert_eq!(payload.kind(), "steal:issue-marked-stealable");
    }
}
