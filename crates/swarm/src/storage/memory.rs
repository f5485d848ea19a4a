//! Volatile in-memory repository.
//!
//! All data lives in RAM and disappears with the instance. This is the
//! conformance-test backend and a reasonable choice for single-process
//! deployments that rebuild state from an external source on start.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::Claim;
use crate::errors::CoordResult;
use crate::events::EventRecord;
use crate::storage::ClaimRepository;

/// In-memory repository backed by a claim map and an event vector.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    claims: RwLock<HashMap<String, Claim>>,
    events: RwLock<Vec<EventRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events appended so far.
    pub fn event_count(&self) -> usize {
        self.events.read().unwrap().len()
    }
}

impl ClaimRepository for InMemoryRepository {
    fn save_claim(&self, claim: &Claim) -> CoordResult<()> {
        self.claims
            .write()
            .unwrap()
            .insert(claim.claim_id.clone(), claim.clone());
        Ok(())
    }

    fn load_claims(&self) -> CoordResult<Vec<Claim>> {
        Ok(self.claims.read().unwrap().values().cloned().collect())
    }

    fn append_event(&self, record: &EventRecord) -> CoordResult<()> {
        self.events.write().unwrap().push(record.clone());
        Ok(())
    }

    fn read_events(&self) -> CoordResult<Vec<EventRecord>> {
        Ok(self.events.read().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Claim, ClaimPriority, Claimant, ClaimantKind};
    use crate::events::EventPayload;
    use chrono::Utc;

    fn sample_claim(id: &str) -> Claim {
        Claim::open(
            id.to_string(),
            "issue-1".to_string(),
            Claimant {
                id: "agent:a1".to_string(),
                kind: ClaimantKind::Agent,
                agent_type: None,
                capabilities: vec![],
            },
            ClaimPriority::Medium,
            Utc::now(),
            None,
            0,
            None,
        )
    }

    #[test]
    fn save_and_load_claims() {
        let repo = InMemoryRepository::new();
        repo.save_claim(&sample_claim("claim-1")).unwrap();
        repo.save_claim(&sample_claim("claim-2")).unwrap();

        let claims = repo.load_claims().unwrap();
        assert_eq!(claims.len(), 2);
    }

    #[test]
    fn save_replaces_existing_claim() {
        let repo = InMemoryRepository::new();
        let mut claim = sample_claim("claim-1");
        repo.save_claim(&claim).unwrap();

        claim.progress = 40;
        repo.save_claim(&claim).unwrap();

        let claims = repo.load_claims().unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].progress, 40);
    }

    #[test]
    fn events_keep_append_order() {
        let repo = InMemoryRepository::new();
        for version in 1..=3 {
            let record = EventRecord {
                id: format!("evt-{}", version),
                aggregate_id: "claim-1".to_string(),
                version,
                issue_id: Some("issue-1".to_string()),
                timestamp: Utc::now(),
                causation_id: None,
                correlation_id: None,
                payload: EventPayload::ProgressUpdated {
                    progress: (version * 10) as u8,
                    by: "agent:a1".to_string(),
                },
            };
            repo.append_event(&record).unwrap();
        }

        let events = repo.read_events().unwrap();
        assert_eq!(events.len(), 3);
        let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }
}
