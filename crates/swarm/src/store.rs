//! Live claim projection with lookup indexes.
//!
//! The store holds every claim (terminal ones included, for history) and the
//! indexes the engines query: the at-most-one non-terminal claim per issue,
//! per-claimant claim sets, per-status sets, and the stealable/contested
//! scanner sets. All mutations arrive as committed events and are folded in
//! with [`crate::domain::Claim::apply_event`] under one write lock, so a
//! multi-event operation (a steal's terminate-and-replace) is applied as one
//! step and observers never see a half-applied swap. The projection writes
//! claims through to the repository and can be rebuilt from the event log
//! alone.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::domain::{Claim, ClaimStatus};
use crate::errors::{CoordResult, CoordinatorError};
use crate::events::{EventPayload, EventRecord};
use crate::storage::ClaimRepository;

#[derive(Default)]
struct StoreInner {
    claims: HashMap<String, Claim>,
    /// issue id -> the single non-terminal claim id
    by_issue: HashMap<String, String>,
    /// claimant id -> non-terminal claim ids
    by_claimant: HashMap<String, BTreeSet<String>>,
    by_status: HashMap<ClaimStatus, BTreeSet<String>>,
    stealable: BTreeSet<String>,
    contested: BTreeSet<String>,
}

impl StoreInner {
    fn index_new(&mut self, claim: &Claim) {
        self.by_issue
            .insert(claim.issue_id.clone(), claim.claim_id.clone());
        self.by_claimant
            .entry(claim.claimant.id.clone())
            .or_default()
            .insert(claim.claim_id.clone());
        self.by_status
            .entry(claim.status)
            .or_default()
            .insert(claim.claim_id.clone());
    }

    fn reindex(&mut self, claim_id: &str, old_status: ClaimStatus) {
        let claim = match self.claims.get(claim_id) {
            Some(c) => c.clone(),
            None => return,
        };

        if old_status != claim.status {
            if let Some(set) = self.by_status.get_mut(&old_status) {
                set.remove(claim_id);
            }
            self.by_status
                .entry(claim.status)
                .or_default()
                .insert(claim_id.to_string());
        }

        if claim.is_terminal() {
            if self.by_issue.get(&claim.issue_id).map(String::as_str) == Some(claim_id) {
                self.by_issue.remove(&claim.issue_id);
            }
            if let Some(set) = self.by_claimant.get_mut(&claim.claimant.id) {
                set.remove(claim_id);
            }
        }

        if claim.status == ClaimStatus::Stealable {
            self.stealable.insert(claim_id.to_string());
        } else {
            self.stealable.remove(claim_id);
        }

        let contest_pending = claim
            .contest
            .as_ref()
            .is_some_and(|c| c.resolution.is_none())
            && !claim.is_terminal();
        if contest_pending {
            self.contested.insert(claim_id.to_string());
        } else {
            self.contested.remove(claim_id);
        }
    }
}

/// Indexed projection of all claims.
pub struct ClaimStore {
    repo: Arc<dyn ClaimRepository>,
    inner: RwLock<StoreInner>,
}

impl ClaimStore {
    /// Create an empty store over `repo`.
    pub fn new(repo: Arc<dyn ClaimRepository>) -> Self {
        Self {
            repo,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Rebuild the projection by replaying an ordered event stream.
    pub fn rebuild(repo: Arc<dyn ClaimRepository>, records: &[EventRecord]) -> CoordResult<Self> {
        let store = Self::new(repo);
        store.apply_all(records)?;
        Ok(store)
    }

    /// Fold committed events into the projection, atomically.
    ///
    /// All records are applied under one write lock; readers see either none
    /// or all of them. Claims touched are written through to the repository.
    ///
    /// # Errors
    ///
    /// `Internal` if an event references an unknown claim or a creation event
    /// collides with an existing non-terminal claim; those indicate a
    /// coordinator bug, and the projection is left as it was before the call
    /// for the offending record onward.
    pub fn apply_all(&self, records: &[EventRecord]) -> CoordResult<()> {
        let mut inner = self.inner.write().unwrap();
        for record in records {
            match &record.payload {
                EventPayload::SwarmRebalanced { .. } => continue,
                EventPayload::ClaimCreated { claim } => {
                    if let Some(existing) = inner.by_issue.get(&claim.issue_id) {
                        return Err(CoordinatorError::internal(format!(
                            "issue {} already has non-terminal claim {}",
                            claim.issue_id, existing
                        )));
                    }
                    inner.claims.insert(claim.claim_id.clone(), claim.clone());
                    inner.index_new(claim);
                    self.repo.save_claim(claim)?;
                }
                _ => {
                    let claim = inner.claims.get_mut(&record.aggregate_id).ok_or_else(|| {
                        CoordinatorError::internal(format!(
                            "event {} references unknown claim {}",
                            record.id, record.aggregate_id
                        ))
                    })?;
                    let old_status = claim.status;
                    claim.apply_event(record);
                    let claim_id = record.aggregate_id.clone();
                    inner.reindex(&claim_id, old_status);
                    let updated = inner.claims.get(&claim_id).expect("claim just updated");
                    self.repo.save_claim(updated)?;
                }
            }
        }
        Ok(())
    }

    /// Fold a single committed event into the projection.
    pub fn apply(&self, record: &EventRecord) -> CoordResult<()> {
        self.apply_all(std::slice::from_ref(record))
    }

    /// Look up a claim by id, terminal or not.
    pub fn get(&self, claim_id: &str) -> Option<Claim> {
        self.inner.read().unwrap().claims.get(claim_id).cloned()
    }

    /// The single non-terminal claim on an issue, if any.
    pub fn active_claim(&self, issue_id: &str) -> Option<Claim> {
        let inner = self.inner.read().unwrap();
        inner
            .by_issue
            .get(issue_id)
            .and_then(|id| inner.claims.get(id))
            .cloned()
    }

    /// Issue ids that currently have a non-terminal claim.
    pub fn claimed_issues(&self) -> HashSet<String> {
        self.inner.read().unwrap().by_issue.keys().cloned().collect()
    }

    /// Non-terminal claims held by a claimant.
    pub fn claims_for(&self, claimant_id: &str) -> Vec<Claim> {
        let inner = self.inner.read().unwrap();
        inner
            .by_claimant
            .get(claimant_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.claims.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All claims ever held by a claimant, optionally filtered by status.
    pub fn history_for(&self, claimant_id: &str, status: Option<ClaimStatus>) -> Vec<Claim> {
        let inner = self.inner.read().unwrap();
        let mut claims: Vec<Claim> = inner
            .claims
            .values()
            .filter(|c| c.claimant.id == claimant_id)
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        claims.sort_by(|a, b| b.claimed_at.cmp(&a.claimed_at));
        claims
    }

    /// Claims currently in `status`.
    pub fn list_status(&self, status: ClaimStatus) -> Vec<Claim> {
        let inner = self.inner.read().unwrap();
        inner
            .by_status
            .get(&status)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.claims.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Claims currently marked stealable.
    pub fn list_stealable(&self) -> Vec<Claim> {
        let inner = self.inner.read().unwrap();
        inner
            .stealable
            .iter()
            .filter_map(|id| inner.claims.get(id))
            .cloned()
            .collect()
    }

    /// Claims with an unresolved contest.
    pub fn list_contested(&self) -> Vec<Claim> {
        let inner = self.inner.read().unwrap();
        inner
            .contested
            .iter()
            .filter_map(|id| inner.claims.get(id))
            .cloned()
            .collect()
    }

    /// All non-terminal claims.
    pub fn non_terminal(&self) -> Vec<Claim> {
        let inner = self.inner.read().unwrap();
        inner
            .by_issue
            .values()
            .filter_map(|id| inner.claims.get(id))
            .cloned()
            .collect()
    }

    /// Every claim, terminal ones included.
    pub fn all(&self) -> Vec<Claim> {
        self.inner.read().unwrap().claims.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimPriority, Claimant, ClaimantKind, ReleaseCause};
    use crate::storage::InMemoryRepository;
    use chrono::Utc;

    fn claimant(id: &str) -> Claimant {
        Claimant {
            id: id.to_string(),
            kind: ClaimantKind::Agent,
            agent_type: None,
            capabilities: vec![],
        }
    }

    fn created(claim: &Claim, version: u64) -> EventRecord {
        EventRecord {
            id: format!("evt-created-{}", claim.claim_id),
            aggregate_id: claim.claim_id.clone(),
            version,
            issue_id: Some(claim.issue_id.clone()),
            timestamp: claim.claimed_at,
            causation_id: None,
            correlation_id: None,
            payload: EventPayload::ClaimCreated {
                claim: claim.clone(),
            },
        }
    }

    fn released(claim_id: &str, issue_id: &str, version: u64) -> EventRecord {
        EventRecord {
            id: format!("evt-released-{}", claim_id),
            aggregate_id: claim_id.to_string(),
            version,
            issue_id: Some(issue_id.to_string()),
            timestamp: Utc::now(),
            causation_id: None,
            correlation_id: None,
            payload: EventPayload::ClaimReleased {
                by: "agent:a1".to_string(),
                cause: ReleaseCause::Manual,
                reason: None,
            },
        }
    }

    fn open(claim_id: &str, issue_id: &str, claimant_id: &str) -> Claim {
        Claim::open(
            claim_id.to_string(),
            issue_id.to_string(),
            claimant(claimant_id),
            ClaimPriority::Medium,
            Utc::now(),
            None,
            0,
            None,
        )
    }

    fn store() -> ClaimStore {
        ClaimStore::new(Arc::new(InMemoryRepository::new()))
    }

    #[test]
    fn created_claim_is_indexed() {
        let store = store();
        let claim = open("claim-1", "issue-1", "agent:a1");
        store.apply(&created(&claim, 1)).unwrap();

        assert_eq!(store.active_claim("issue-1").unwrap().claim_id, "claim-1");
        assert_eq!(store.claims_for("agent:a1").len(), 1);
        assert_eq!(store.list_status(ClaimStatus::Active).len(), 1);
    }

    #[test]
    fn second_creation_on_same_issue_is_rejected() {
        let store = store();
        store
            .apply(&created(&open("claim-1", "issue-1", "agent:a1"), 1))
            .unwrap();
        let err = store
            .apply(&created(&open("claim-2", "issue-1", "agent:a2"), 1))
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn terminal_claim_leaves_indexes_but_keeps_record() {
        let store = store();
        let claim = open("claim-1", "issue-1", "agent:a1");
        store.apply(&created(&claim, 1)).unwrap();
        store.apply(&released("claim-1", "issue-1", 2)).unwrap();

        assert!(store.active_claim("issue-1").is_none());
        assert!(store.claims_for("agent:a1").is_empty());
        let stored = store.get("claim-1").unwrap();
        assert_eq!(stored.status, ClaimStatus::Released);
        assert_eq!(stored.status_history.len(), 2);
    }

    #[test]
    fn released_issue_can_be_claimed_again() {
        let store = store();
        store
            .apply(&created(&open("claim-1", "issue-1", "agent:a1"), 1))
            .unwrap();
        store.apply(&released("claim-1", "issue-1", 2)).unwrap();
        store
            .apply(&created(&open("claim-2", "issue-1", "agent:a2"), 1))
            .unwrap();

        assert_eq!(store.active_claim("issue-1").unwrap().claim_id, "claim-2");
        assert_eq!(store.all().len(), 2);
    }

    #[test]
    fn rebuild_replays_to_the_same_projection() {
        let repo = Arc::new(InMemoryRepository::new());
        let store = ClaimStore::new(repo.clone());
        let claim = open("claim-1", "issue-1", "agent:a1");
        let records = vec![created(&claim, 1), released("claim-1", "issue-1", 2)];
        store.apply_all(&records).unwrap();

        let rebuilt = ClaimStore::rebuild(repo, &records).unwrap();
        assert_eq!(rebuilt.get("claim-1"), store.get("claim-1"));
        assert!(rebuilt.active_claim("issue-1").is_none());
    }

    #[test]
    fn unknown_aggregate_event_is_internal_error() {
        let store = store();
        let err = store
            .apply(&released("claim-ghost", "issue-1", 1))
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }
}
