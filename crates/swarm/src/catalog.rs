//! External catalogues the coordinator reads but does not own.
//!
//! Issues and claimant profiles live outside the core; the coordinator only
//! reads the fields it needs through these interfaces. The in-memory
//! implementations back the conformance tests and small deployments.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::{ClaimPriority, ClaimantKind};

/// The slice of an issue the coordinator reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssueRef {
    pub issue_id: String,
    pub title: String,
    pub priority: ClaimPriority,
    /// Labels double as capability requirements for capability-aware moves
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

/// Read access to the issue catalogue.
pub trait IssueCatalog: Send + Sync {
    /// Look up an issue by id.
    fn get(&self, issue_id: &str) -> Option<IssueRef>;

    /// All known issues, in unspecified order.
    fn list(&self) -> Vec<IssueRef>;

    /// Check whether an issue exists.
    fn exists(&self, issue_id: &str) -> bool {
        self.get(issue_id).is_some()
    }
}

/// The slice of a claimant profile the coordinator reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimantProfile {
    pub id: String,
    pub kind: ClaimantKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    /// Overrides the configured `maxClaimsPerAgent` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_claims: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Read access to the claimant directory.
pub trait ClaimantDirectory: Send + Sync {
    /// Look up a claimant profile by id.
    fn get(&self, claimant_id: &str) -> Option<ClaimantProfile>;

    /// All registered claimants, in unspecified order.
    fn list(&self) -> Vec<ClaimantProfile>;
}

/// In-memory issue catalogue.
#[derive(Debug, Default)]
pub struct InMemoryIssueCatalog {
    issues: RwLock<HashMap<String, IssueRef>>,
}

impl InMemoryIssueCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an issue.
    pub fn insert(&self, issue: IssueRef) {
        self.issues
            .write()
            .unwrap()
            .insert(issue.issue_id.clone(), issue);
    }

    /// Remove an issue; claims referencing it are unaffected.
    pub fn remove(&self, issue_id: &str) {
        self.issues.write().unwrap().remove(issue_id);
    }
}

impl IssueCatalog for InMemoryIssueCatalog {
    fn get(&self, issue_id: &str) -> Option<IssueRef> {
        self.issues.read().unwrap().get(issue_id).cloned()
    }

    fn list(&self) -> Vec<IssueRef> {
        self.issues.read().unwrap().values().cloned().collect()
    }
}

/// In-memory claimant directory.
#[derive(Debug, Default)]
pub struct InMemoryClaimantDirectory {
    claimants: RwLock<HashMap<String, ClaimantProfile>>,
}

impl InMemoryClaimantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update a claimant profile.
    pub fn register(&self, profile: ClaimantProfile) {
        self.claimants
            .write()
            .unwrap()
            .insert(profile.id.clone(), profile);
    }
}

impl ClaimantDirectory for InMemoryClaimantDirectory {
    fn get(&self, claimant_id: &str) -> Option<ClaimantProfile> {
        self.claimants.read().unwrap().get(claimant_id).cloned()
    }

    fn list(&self) -> Vec<ClaimantProfile> {
        self.claimants.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(id: &str, priority: ClaimPriority) -> IssueRef {
        IssueRef {
            issue_id: id.to_string(),
            title: format!("Issue {}", id),
            priority,
            labels: vec![],
            repository: None,
        }
    }

    #[test]
    fn catalog_insert_and_lookup() {
        let catalog = InMemoryIssueCatalog::new();
        catalog.insert(issue("issue-1", ClaimPriority::High));

        assert!(catalog.exists("issue-1"));
        assert!(!catalog.exists("issue-2"));
        assert_eq!(catalog.get("issue-1").unwrap().priority, ClaimPriority::High);
    }

    #[test]
    fn catalog_insert_replaces() {
        let catalog = InMemoryIssueCatalog::new();
        catalog.insert(issue("issue-1", ClaimPriority::Low));
        catalog.insert(issue("issue-1", ClaimPriority::Critical));

        assert_eq!(catalog.list().len(), 1);
        assert_eq!(
            catalog.get("issue-1").unwrap().priority,
            ClaimPriority::Critical
        );
    }

    #[test]
    fn directory_register_and_lookup() {
        let directory = InMemoryClaimantDirectory::new();
        directory.register(ClaimantProfile {
            id: "agent:coder-1".to_string(),
            kind: ClaimantKind::Agent,
            agent_type: Some("coder".to_string()),
            max_concurrent_claims: Some(3),
            capabilities: vec!["rust".to_string()],
        });

        let profile = directory.get("agent:coder-1").unwrap();
        assert_eq!(profile.max_concurrent_claims, Some(3));
        assert!(directory.get("agent:unknown").is_none());
    }
}
