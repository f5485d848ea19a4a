//! Named-operation dispatch surface.
//!
//! The surface is the outermost layer of the core: it validates operation
//! inputs against typed records (unknown fields and out-of-range options are
//! rejected), routes to the engines, and always returns a result record.
//! Errors are data, never panics or exceptions across this boundary. A
//! transport (stdio, HTTP, whatever) marshals requests here and must not
//! bypass it.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::config::SharedConfig;
use crate::domain::{
    ClaimPriority, ClaimStatus, Claimant, ClaimantKind, HandoffReason, StealableReason,
};
use crate::errors::{CoordResult, CoordinatorError};
use crate::manager::{AvailableFilter, BoardGrouping, ClaimManager};
use crate::rebalance::{RebalanceStrategy, Rebalancer};
use crate::steal::StealEngine;

/// Error record returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

/// Result record for every operation: either `data` or `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResponse {
    fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(err: &CoordinatorError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ToolError {
                kind: err.kind().to_string(),
                message: err.to_string(),
                details: err.details(),
            }),
        }
    }
}

/// Metric time ranges offered by `claim_metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    #[serde(rename = "all")]
    All,
}

impl TimeRange {
    fn window(self) -> Option<chrono::Duration> {
        match self {
            TimeRange::Hour => Some(chrono::Duration::hours(1)),
            TimeRange::Day => Some(chrono::Duration::hours(24)),
            TimeRange::Week => Some(chrono::Duration::days(7)),
            TimeRange::Month => Some(chrono::Duration::days(30)),
            TimeRange::All => None,
        }
    }
}

/// Caller-facing status set for `issue_status_update`.
///
/// Pausing, handoffs, and steal marking go through dedicated operations; this
/// projection keeps the general update unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum StatusUpdate {
    Active,
    Blocked,
    InReview,
    Completed,
}

impl StatusUpdate {
    fn as_claim_status(self) -> ClaimStatus {
        match self {
            StatusUpdate::Active => ClaimStatus::Active,
            StatusUpdate::Blocked => ClaimStatus::Blocked,
            StatusUpdate::InReview => ClaimStatus::ReviewRequested,
            StatusUpdate::Completed => ClaimStatus::Completed,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ClaimInput {
    issue_id: String,
    claimant_id: String,
    claimant_kind: ClaimantKind,
    #[serde(default)]
    agent_type: Option<String>,
    #[serde(default)]
    priority: Option<ClaimPriority>,
    #[serde(default)]
    ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReleaseInput {
    issue_id: String,
    claimant_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct HandoffInput {
    issue_id: String,
    from_id: String,
    reason: HandoffReason,
    #[serde(default)]
    to_id: Option<String>,
    #[serde(default)]
    to_kind: Option<ClaimantKind>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StatusUpdateInput {
    issue_id: String,
    claimant_id: String,
    status: StatusUpdate,
    #[serde(default)]
    progress: Option<u8>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ListAvailableInput {
    #[serde(default)]
    priority: Option<ClaimPriority>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    repository: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ListMineInput {
    claimant_id: String,
    #[serde(default)]
    status: Option<ClaimStatus>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BoardInput {
    #[serde(default = "default_true")]
    include_agents: bool,
    #[serde(default = "default_true")]
    include_humans: bool,
    #[serde(default)]
    group_by: Option<BoardGrouping>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MarkStealableInput {
    issue_id: String,
    claimant_id: String,
    #[serde(default)]
    reason: Option<StealableReason>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StealInput {
    issue_id: String,
    stealer_id: String,
    stealer_kind: ClaimantKind,
    #[serde(default)]
    stealer_type: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GetStealableInput {
    #[serde(default)]
    priority: Option<ClaimPriority>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ContestInput {
    issue_id: String,
    contester_id: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LoadInfoInput {
    agent_id: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RebalanceInput {
    #[serde(default)]
    strategy: Option<RebalanceStrategy>,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LoadOverviewInput {
    #[serde(default)]
    include_recommendations: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct HistoryInput {
    issue_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MetricsInput {
    #[serde(default)]
    time_range: Option<TimeRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ConfigAction {
    Get,
    Set,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigInput {
    action: ConfigAction,
    #[serde(default)]
    config: Option<Value>,
}

/// The operation dispatcher.
pub struct ToolSurface {
    manager: Arc<ClaimManager>,
    steal: Arc<StealEngine>,
    rebalancer: Arc<Rebalancer>,
    config: SharedConfig,
}

impl ToolSurface {
    pub fn new(
        manager: Arc<ClaimManager>,
        steal: Arc<StealEngine>,
        rebalancer: Arc<Rebalancer>,
        config: SharedConfig,
    ) -> Self {
        Self {
            manager,
            steal,
            rebalancer,
            config,
        }
    }

    /// Names of every operation this surface serves.
    pub const OPERATIONS: [&'static str; 17] = [
        "issue_claim",
        "issue_release",
        "issue_handoff",
        "issue_status_update",
        "issue_list_available",
        "issue_list_mine",
        "issue_board",
        "issue_mark_stealable",
        "issue_steal",
        "issue_get_stealable",
        "issue_contest_steal",
        "agent_load_info",
        "swarm_rebalance",
        "swarm_load_overview",
        "claim_history",
        "claim_metrics",
        "claim_config",
    ];

    /// Invoke one operation with a JSON input record.
    pub fn call(&self, operation: &str, input: Value) -> ToolResponse {
        match self.dispatch(operation, input) {
            Ok(data) => ToolResponse::success(data),
            Err(err) => ToolResponse::failure(&err),
        }
    }

    fn dispatch(&self, operation: &str, input: Value) -> CoordResult<Value> {
        match operation {
            "issue_claim" => self.issue_claim(parse(input)?),
            "issue_release" => self.issue_release(parse(input)?),
            "issue_handoff" => self.issue_handoff(parse(input)?),
            "issue_status_update" => self.issue_status_update(parse(input)?),
            "issue_list_available" => self.issue_list_available(parse(input)?),
            "issue_list_mine" => self.issue_list_mine(parse(input)?),
            "issue_board" => self.issue_board(parse(input)?),
            "issue_mark_stealable" => self.issue_mark_stealable(parse(input)?),
            "issue_steal" => self.issue_steal(parse(input)?),
            "issue_get_stealable" => self.issue_get_stealable(parse(input)?),
            "issue_contest_steal" => self.issue_contest_steal(parse(input)?),
            "agent_load_info" => self.agent_load_info(parse(input)?),
            "swarm_rebalance" => self.swarm_rebalance(parse(input)?),
            "swarm_load_overview" => self.swarm_load_overview(parse(input)?),
            "claim_history" => self.claim_history(parse(input)?),
            "claim_metrics" => self.claim_metrics(parse(input)?),
            "claim_config" => self.claim_config(parse(input)?),
            other => Err(CoordinatorError::validation(format!(
                "unknown operation: {}",
                other
            ))),
        }
    }

    fn issue_claim(&self, input: ClaimInput) -> CoordResult<Value> {
        let claimant = Claimant {
            id: input.claimant_id,
            kind: input.claimant_kind,
            agent_type: input.agent_type,
            capabilities: Vec::new(),
        };
        let claim = self
            .manager
            .claim(&input.issue_id, claimant, input.priority, input.ttl_ms)?;
        Ok(json!({
            "claimId": claim.claim_id,
            "status": claim.status,
            "claimedAt": claim.claimed_at,
            "expiresAt": claim.expires_at,
        }))
    }

    fn issue_release(&self, input: ReleaseInput) -> CoordResult<Value> {
        let claim = self
            .manager
            .release(&input.issue_id, &input.claimant_id, input.reason)?;
        Ok(json!({
            "released": true,
            "releasedAt": claim.last_activity_at,
        }))
    }

    fn issue_handoff(&self, input: HandoffInput) -> CoordResult<Value> {
        let handoff = self.manager.request_handoff(
            &input.issue_id,
            &input.from_id,
            input.to_id,
            input.to_kind,
            input.reason,
            input.notes,
        )?;
        Ok(json!({
            "handoffId": handoff.handoff_id,
            "status": ClaimStatus::HandoffPending,
            "createdAt": handoff.requested_at,
        }))
    }

    fn issue_status_update(&self, input: StatusUpdateInput) -> CoordResult<Value> {
        let claim = self.manager.update_status(
            &input.issue_id,
            &input.claimant_id,
            input.status.as_claim_status(),
            input.notes,
            input.progress,
        )?;
        Ok(json!({
            "status": claim.status,
            "updatedAt": claim.last_activity_at,
        }))
    }

    fn issue_list_available(&self, input: ListAvailableInput) -> CoordResult<Value> {
        let limit = input.limit.unwrap_or(50);
        if limit > 100 {
            return Err(CoordinatorError::validation("limit must be at most 100"));
        }
        let filter = AvailableFilter {
            priority: input.priority,
            labels: input.labels,
            repository: input.repository,
            limit,
            offset: input.offset.unwrap_or(0),
        };
        let (issues, total) = self.manager.list_available(&filter);
        Ok(json!({ "issues": issues, "total": total }))
    }

    fn issue_list_mine(&self, input: ListMineInput) -> CoordResult<Value> {
        let (claims, total) = self.manager.list_mine(
            &input.claimant_id,
            input.status,
            input.limit.unwrap_or(50),
            input.offset.unwrap_or(0),
        );
        Ok(json!({ "claims": claims, "total": total }))
    }

    fn issue_board(&self, input: BoardInput) -> CoordResult<Value> {
        let board = self.manager.board(
            input.include_agents,
            input.include_humans,
            input.group_by.unwrap_or(BoardGrouping::Claimant),
        );
        Ok(json!({ "claims": board.groups, "counts": board.counts }))
    }

    fn issue_mark_stealable(&self, input: MarkStealableInput) -> CoordResult<Value> {
        let claim = self.steal.mark_stealable(
            &input.issue_id,
            &input.claimant_id,
            input.reason.unwrap_or(StealableReason::Manual),
        )?;
        let marked_at = claim
            .stealable
            .as_ref()
            .map(|s| s.marked_at)
            .unwrap_or(claim.last_activity_at);
        Ok(json!({ "marked": true, "markedAt": marked_at }))
    }

    fn issue_steal(&self, input: StealInput) -> CoordResult<Value> {
        let stealer = Claimant {
            id: input.stealer_id,
            kind: input.stealer_kind,
            agent_type: input.stealer_type,
            capabilities: Vec::new(),
        };
        let outcome = self.steal.steal(&input.issue_id, stealer, input.reason)?;
        let contest_window_ms = outcome
            .contest_window_ends_at
            .map(|_| self.config.get().contest_window_ms)
            .unwrap_or(0);
        Ok(json!({
            "stolen": true,
            "newClaimId": outcome.new_claim.claim_id,
            "previousClaimant": outcome.previous_claimant,
            "contestWindowMs": contest_window_ms,
        }))
    }

    fn issue_get_stealable(&self, input: GetStealableInput) -> CoordResult<Value> {
        let claims = self
            .steal
            .list_stealable(input.priority, input.limit.unwrap_or(50));
        let entries: Vec<Value> = claims
            .iter()
            .map(|claim| {
                json!({
                    "issueId": claim.issue_id,
                    "claimId": claim.claim_id,
                    "claimant": claim.claimant.id,
                    "priority": claim.priority,
                    "progress": claim.progress,
                    "reason": claim.stealable.as_ref().map(|s| s.reason),
                    "markedAt": claim.stealable.as_ref().map(|s| s.marked_at),
                })
            })
            .collect();
        Ok(json!({ "stealable": entries }))
    }

    fn issue_contest_steal(&self, input: ContestInput) -> CoordResult<Value> {
        let contest =
            self.steal
                .contest(&input.issue_id, &input.contester_id, &input.reason)?;
        Ok(json!({
            "contestId": contest.contest_id,
            "status": "pending",
            "endsAt": contest.ends_at,
        }))
    }

    fn agent_load_info(&self, input: LoadInfoInput) -> CoordResult<Value> {
        let sample = self.manager.load.sample(&input.agent_id);
        Ok(serde_json::to_value(sample)
            .map_err(|e| CoordinatorError::internal(e.to_string()))?)
    }

    fn swarm_rebalance(&self, input: RebalanceInput) -> CoordResult<Value> {
        let report = self.rebalancer.rebalance(input.strategy, input.dry_run)?;
        serde_json::to_value(&report).map_err(|e| CoordinatorError::internal(e.to_string()))
    }

    fn swarm_load_overview(&self, input: LoadOverviewInput) -> CoordResult<Value> {
        let overview = self.manager.load_overview(input.include_recommendations);
        serde_json::to_value(&overview).map_err(|e| CoordinatorError::internal(e.to_string()))
    }

    fn claim_history(&self, input: HistoryInput) -> CoordResult<Value> {
        let entries = self
            .manager
            .history(&input.issue_id, input.limit.unwrap_or(0));
        Ok(json!({ "history": entries }))
    }

    fn claim_metrics(&self, input: MetricsInput) -> CoordResult<Value> {
        let window = input.time_range.unwrap_or(TimeRange::All).window();
        let metrics = self.manager.metrics(window);
        serde_json::to_value(&metrics).map_err(|e| CoordinatorError::internal(e.to_string()))
    }

    fn claim_config(&self, input: ConfigInput) -> CoordResult<Value> {
        let current = match input.action {
            ConfigAction::Get => self.config.get(),
            ConfigAction::Set => {
                let update = input.config.ok_or_else(|| {
                    CoordinatorError::validation("config is required for action=set")
                })?;
                self.config.update(&update)?
            }
        };
        Ok(json!({
            "config": serde_json::to_value(current)
                .map_err(|e| CoordinatorError::internal(e.to_string()))?
        }))
    }

    /// Machine-readable catalogue of operations, their fields, and the
    /// enumerated option sets, for caller introspection.
    pub fn schema(&self) -> Value {
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "operations": {
                "issue_claim": {
                    "required": ["issueId", "claimantId", "claimantKind"],
                    "optional": ["agentType", "priority", "ttlMs"],
                },
                "issue_release": {
                    "required": ["issueId", "claimantId"],
                    "optional": ["reason"],
                },
                "issue_handoff": {
                    "required": ["issueId", "fromId", "reason"],
                    "optional": ["toId", "toKind", "notes"],
                    "reasons": ["blocked", "expertise-needed", "capacity", "reassignment", "other"],
                },
                "issue_status_update": {
                    "required": ["issueId", "claimantId", "status"],
                    "optional": ["progress", "notes"],
                    "statuses": ["active", "blocked", "in-review", "completed"],
                },
                "issue_list_available": {
                    "required": [],
                    "optional": ["priority", "labels", "repository", "limit", "offset"],
                },
                "issue_list_mine": {
                    "required": ["claimantId"],
                    "optional": ["status", "limit", "offset"],
                },
                "issue_board": {
                    "required": [],
                    "optional": ["includeAgents", "includeHumans", "groupBy"],
                    "groupings": ["claimant", "priority", "status"],
                },
                "issue_mark_stealable": {
                    "required": ["issueId", "claimantId"],
                    "optional": ["reason"],
                },
                "issue_steal": {
                    "required": ["issueId", "stealerId", "stealerKind"],
                    "optional": ["stealerType", "reason"],
                },
                "issue_get_stealable": {
                    "required": [],
                    "optional": ["priority", "limit"],
                },
                "issue_contest_steal": {
                    "required": ["issueId", "contesterId", "reason"],
                },
                "agent_load_info": {
                    "required": ["agentId"],
                },
                "swarm_rebalance": {
                    "required": [],
                    "optional": ["strategy", "dryRun"],
                    "strategies": ["round-robin", "least-loaded", "priority-based", "capability-based"],
                },
                "swarm_load_overview": {
                    "required": [],
                    "optional": ["includeRecommendations"],
                },
                "claim_history": {
                    "required": ["issueId"],
                    "optional": ["limit"],
                },
                "claim_metrics": {
                    "required": [],
                    "optional": ["timeRange"],
                    "timeRanges": ["1h", "24h", "7d", "30d", "all"],
                },
                "claim_config": {
                    "required": ["action"],
                    "optional": ["config"],
                    "actions": ["get", "set"],
                },
            },
            "priorities": ["critical", "high", "medium", "low"],
            "claimantKinds": ["human", "agent"],
        })
    }
}

fn parse<T: DeserializeOwned>(input: Value) -> CoordResult<T> {
    serde_json::from_value(input)
        .map_err(|e| CoordinatorError::validation(format!("invalid input: {}", e)))
}
