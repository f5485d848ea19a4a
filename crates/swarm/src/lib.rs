//! Swarm — issue-claim coordination for multi-agent work.
//!
//! The coordinator arbitrates which worker currently owns each issue,
//! detects stale or overloaded holders, lets eligible workers steal claims
//! under grace and contest rules, and rebalances load across the swarm. All
//! state changes flow through an append-only event log; the live projection
//! is rebuildable from that log alone.

pub mod bus;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod errors;
pub mod event_log;
pub mod events;
pub mod expiry;
pub mod ids;
pub mod load;
pub mod locks;
pub mod manager;
pub mod rebalance;
pub mod steal;
pub mod storage;
pub mod store;
pub mod surface;

// Re-export commonly used types
pub use catalog::{
    ClaimantDirectory, ClaimantProfile, InMemoryClaimantDirectory, InMemoryIssueCatalog,
    IssueCatalog, IssueRef,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoordinatorConfig, SharedConfig};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use domain::{Claim, ClaimPriority, ClaimStatus, Claimant, ClaimantKind};
pub use errors::{CoordResult, CoordinatorError};
pub use events::{EventPayload, EventRecord};
pub use rebalance::RebalanceStrategy;
pub use storage::{ClaimRepository, InMemoryRepository};
pub use surface::{ToolResponse, ToolSurface};
