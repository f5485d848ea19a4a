//! Error taxonomy for coordinator operations.
//!
//! Every operation returns `Result<T, CoordinatorError>`. The variants map
//! 1:1 onto the error kinds callers see in result records; [`CoordinatorError::kind`]
//! produces the stable kind string and [`CoordinatorError::details`] the
//! structured context, so the ToolSurface never has to parse messages.

use crate::domain::ClaimStatus;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Result alias used throughout the coordinator.
pub type CoordResult<T> = std::result::Result<T, CoordinatorError>;

/// Failure modes surfaced to callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinatorError {
    #[error("unknown issue: {issue_id}")]
    UnknownIssue { issue_id: String },

    #[error("issue {issue_id} is already claimed by {claimant_id}")]
    AlreadyClaimed {
        issue_id: String,
        claimant_id: String,
    },

    #[error("issue {issue_id} has no active claim")]
    NotClaimed { issue_id: String },

    #[error("claim on {issue_id} is held by {owner}, not {caller}")]
    NotOwner {
        issue_id: String,
        owner: String,
        caller: String,
    },

    #[error("illegal status transition: {from} -> {to}")]
    InvalidTransition { from: ClaimStatus, to: ClaimStatus },

    #[error("{claimant_id} holds {active} claims, at the limit of {max}")]
    MaxClaimsExceeded {
        claimant_id: String,
        active: usize,
        max: u32,
    },

    #[error("{message}")]
    Validation { message: String },

    #[error("claim on {issue_id} is protected by its grace period until {until}")]
    InGrace {
        issue_id: String,
        until: DateTime<Utc>,
    },

    #[error("issue {issue_id} is not stealable")]
    NotStealable { issue_id: String },

    #[error("cross-type steal {holder_type} -> {stealer_type} is not allowed")]
    CrossTypeNotAllowed {
        holder_type: String,
        stealer_type: String,
    },

    #[error("claim on {issue_id} is protected at {progress}% progress")]
    ProtectedByProgress { issue_id: String, progress: u8 },

    #[error("{stealer_id} is at capacity and cannot take on a stolen claim")]
    StealerOverloaded { stealer_id: String },

    #[error("issue {issue_id} has no steal open to contest")]
    NoActiveSteal { issue_id: String },

    #[error("contest window for issue {issue_id} closed at {closed_at}")]
    WindowClosed {
        issue_id: String,
        closed_at: DateTime<Utc>,
    },

    #[error("{contester_id} is not eligible to contest this steal")]
    NotEligibleContester { contester_id: String },

    #[error("handoff {handoff_id} not found")]
    HandoffNotFound { handoff_id: String },

    #[error("a contest is already pending on issue {issue_id}")]
    ContestPending { issue_id: String },

    #[error("operation timed out before entering the critical section")]
    Timeout,

    #[error("lost update race: {message}")]
    Conflict { message: String },

    #[error("internal invariant violation: {message}")]
    Internal { message: String },
}

impl CoordinatorError {
    /// Convenience constructor for input validation failures.
    pub fn validation(message: impl Into<String>) -> Self {
        CoordinatorError::Validation {
            message: message.into(),
        }
    }

    /// Convenience constructor for internal invariant violations.
    pub fn internal(message: impl Into<String>) -> Self {
        CoordinatorError::Internal {
            message: message.into(),
        }
    }

    /// Stable kind string used in result records.
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::UnknownIssue { .. } => "unknown-issue",
            CoordinatorError::AlreadyClaimed { .. } => "already-claimed",
            CoordinatorError::NotClaimed { .. } => "not-claimed",
            CoordinatorError::NotOwner { .. } => "not-owner",
            CoordinatorError::InvalidTransition { .. } => "invalid-transition",
            CoordinatorError::MaxClaimsExceeded { .. } => "max-claims-exceeded",
            CoordinatorError::Validation { .. } => "validation-error",
            CoordinatorError::InGrace { .. } => "in-grace",
            CoordinatorError::NotStealable { .. } => "not-stealable",
            CoordinatorError::CrossTypeNotAllowed { .. } => "cross-type-not-allowed",
            CoordinatorError::ProtectedByProgress { .. } => "protected-by-progress",
            CoordinatorError::StealerOverloaded { .. } => "stealer-overloaded",
            CoordinatorError::NoActiveSteal { .. } => "no-active-steal",
            CoordinatorError::WindowClosed { .. } => "window-closed",
            CoordinatorError::NotEligibleContester { .. } => "not-eligible-contester",
            CoordinatorError::HandoffNotFound { .. } => "handoff-not-found",
            CoordinatorError::ContestPending { .. } => "contest-pending",
            CoordinatorError::Timeout => "timeout",
            CoordinatorError::Conflict { .. } => "conflict",
            CoordinatorError::Internal { .. } => "internal",
        }
    }

    /// Structured context for result records.
    pub fn details(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            CoordinatorError::UnknownIssue { issue_id }
            | CoordinatorError::NotClaimed { issue_id }
            | CoordinatorError::NotStealable { issue_id }
            | CoordinatorError::NoActiveSteal { issue_id }
            | CoordinatorError::ContestPending { issue_id } => {
                map.insert("issueId".into(), json!(issue_id));
            }
            CoordinatorError::AlreadyClaimed {
                issue_id,
                claimant_id,
            } => {
                map.insert("issueId".into(), json!(issue_id));
                map.insert("claimantId".into(), json!(claimant_id));
            }
            CoordinatorError::NotOwner {
                issue_id,
                owner,
                caller,
            } => {
                map.insert("issueId".into(), json!(issue_id));
                map.insert("owner".into(), json!(owner));
                map.insert("caller".into(), json!(caller));
            }
            CoordinatorError::InvalidTransition { from, to } => {
                map.insert("from".into(), json!(from));
                map.insert("to".into(), json!(to));
            }
            CoordinatorError::MaxClaimsExceeded {
                claimant_id,
                active,
                max,
            } => {
                map.insert("claimantId".into(), json!(claimant_id));
                map.insert("activeClaims".into(), json!(active));
                map.insert("maxClaims".into(), json!(max));
            }
            CoordinatorError::InGrace { issue_id, until } => {
                map.insert("issueId".into(), json!(issue_id));
                map.insert("graceEndsAt".into(), json!(until));
            }
            CoordinatorError::CrossTypeNotAllowed {
                holder_type,
                stealer_type,
            } => {
                map.insert("holderType".into(), json!(holder_type));
                map.insert("stealerType".into(), json!(stealer_type));
            }
            CoordinatorError::ProtectedByProgress { issue_id, progress } => {
                map.insert("issueId".into(), json!(issue_id));
                map.insert("progress".into(), json!(progress));
            }
            CoordinatorError::StealerOverloaded { stealer_id } => {
                map.insert("stealerId".into(), json!(stealer_id));
            }
            CoordinatorError::WindowClosed {
                issue_id,
                closed_at,
            } => {
                map.insert("issueId".into(), json!(issue_id));
                map.insert("closedAt".into(), json!(closed_at));
            }
            CoordinatorError::NotEligibleContester { contester_id } => {
                map.insert("contesterId".into(), json!(contester_id));
            }
            CoordinatorError::HandoffNotFound { handoff_id } => {
                map.insert("handoffId".into(), json!(handoff_id));
            }
            CoordinatorError::Validation { .. }
            | CoordinatorError::Timeout
            | CoordinatorError::Conflict { .. }
            | CoordinatorError::Internal { .. } => {}
        }
        map
    }
}
