//! Append-only, per-aggregate versioned event log.
//!
//! The log assigns each event the next version for its aggregate at append
//! time and writes through to the repository, all under one lock, so the
//! version sequence is strictly increasing with no gaps. Replay queries
//! (`stream`, `by_type`, `by_issue`) serve observability and projection
//! rebuilds.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::clock::Clock;
use crate::errors::CoordResult;
use crate::events::{EventPayload, EventRecord};
use crate::ids::IdGen;
use crate::storage::ClaimRepository;

/// An event awaiting version assignment.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub aggregate_id: String,
    pub issue_id: Option<String>,
    pub payload: EventPayload,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl EventDraft {
    pub fn new(aggregate_id: impl Into<String>, issue_id: Option<String>, payload: EventPayload) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            issue_id,
            payload,
            causation_id: None,
            correlation_id: None,
        }
    }

    pub fn caused_by(mut self, event_id: impl Into<String>) -> Self {
        self.causation_id = Some(event_id.into());
        self
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Default)]
struct LogInner {
    by_aggregate: HashMap<String, Vec<EventRecord>>,
    all: Vec<EventRecord>,
}

/// The versioned event log.
pub struct EventLog {
    repo: Arc<dyn ClaimRepository>,
    clock: Arc<dyn Clock>,
    ids: IdGen,
    inner: Mutex<LogInner>,
}

impl EventLog {
    /// Create a log over `repo`, replaying any events it already holds.
    ///
    /// Version gaps found during hydration are reported with a warning; the
    /// log continues from the highest version seen per aggregate.
    pub fn new(repo: Arc<dyn ClaimRepository>, clock: Arc<dyn Clock>, ids: IdGen) -> CoordResult<Self> {
        let mut inner = LogInner::default();
        for record in repo.read_events()? {
            let stream = inner.by_aggregate.entry(record.aggregate_id.clone()).or_default();
            let expected = stream.last().map(|r| r.version).unwrap_or(0) + 1;
            if record.version != expected {
                warn!(
                    aggregate_id = %record.aggregate_id,
                    expected,
                    found = record.version,
                    "event log version gap during hydration"
                );
            }
            stream.push(record.clone());
            inner.all.push(record);
        }
        Ok(Self {
            repo,
            clock,
            ids,
            inner: Mutex::new(inner),
        })
    }

    /// Append one event, assigning its id, version, and timestamp.
    ///
    /// Version assignment happens under the log lock, so two events can never
    /// share an `(aggregate_id, version)` pair. Timestamps are clamped to be
    /// non-decreasing per aggregate.
    ///
    /// # Errors
    ///
    /// Fails only if the repository rejects the write.
    pub fn append(&self, draft: EventDraft) -> CoordResult<EventRecord> {
        let mut inner = self.inner.lock().unwrap();
        let stream = inner.by_aggregate.entry(draft.aggregate_id.clone()).or_default();

        let version = stream.last().map(|r| r.version).unwrap_or(0) + 1;

        let mut timestamp = self.clock.now();
        if let Some(last) = stream.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }

        let record = EventRecord {
            id: self.ids.event_id(),
            aggregate_id: draft.aggregate_id,
            version,
            issue_id: draft.issue_id,
            timestamp,
            causation_id: draft.causation_id,
            correlation_id: draft.correlation_id,
            payload: draft.payload,
        };

        self.repo.append_event(&record)?;
        stream.push(record.clone());
        inner.all.push(record.clone());
        Ok(record)
    }

    /// Ordered replay of one aggregate, optionally starting at a version.
    pub fn stream(&self, aggregate_id: &str, from_version: Option<u64>) -> Vec<EventRecord> {
        let inner = self.inner.lock().unwrap();
        let from = from_version.unwrap_or(1);
        inner
            .by_aggregate
            .get(aggregate_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.version >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All events of one kind, optionally restricted to a time range.
    pub fn by_type(
        &self,
        kind: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Vec<EventRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .all
            .iter()
            .filter(|r| r.kind() == kind)
            .filter(|r| match range {
                Some((from, to)) => r.timestamp >= from && r.timestamp <= to,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// All events concerning one issue, across every claim it had.
    pub fn by_issue(&self, issue_id: &str) -> Vec<EventRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .all
            .iter()
            .filter(|r| r.issue_id.as_deref() == Some(issue_id))
            .cloned()
            .collect()
    }

    /// Every event in append order.
    pub fn all(&self) -> Vec<EventRecord> {
        self.inner.lock().unwrap().all.clone()
    }

    /// Highest version assigned for an aggregate (0 if none).
    pub fn last_version(&self, aggregate_id: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .by_aggregate
            .get(aggregate_id)
            .and_then(|records| records.last())
            .map(|r| r.version)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::events::EventPayload;
    use crate::storage::InMemoryRepository;
    use chrono::Duration;

    fn progress_draft(aggregate: &str, progress: u8) -> EventDraft {
        EventDraft::new(
            aggregate,
            Some("issue-1".to_string()),
            EventPayload::ProgressUpdated {
                progress,
                by: "agent:a1".to_string(),
            },
        )
    }

    fn new_log() -> (Arc<InMemoryRepository>, EventLog) {
        let repo = Arc::new(InMemoryRepository::new());
        let log = EventLog::new(repo.clone(), Arc::new(SystemClock), IdGen::new()).unwrap();
        (repo, log)
    }

    #[test]
    fn versions_start_at_one_and_have_no_gaps() {
        let (_repo, log) = new_log();

        for i in 1..=5u8 {
            let record = log.append(progress_draft("claim-1", i * 10)).unwrap();
            assert_eq!(record.version, i as u64);
        }
        assert_eq!(log.last_version("claim-1"), 5);
    }

    #[test]
    fn versions_are_independent_per_aggregate() {
        let (_repo, log) = new_log();

        log.append(progress_draft("claim-1", 10)).unwrap();
        log.append(progress_draft("claim-1", 20)).unwrap();
        let record = log.append(progress_draft("claim-2", 10)).unwrap();

        assert_eq!(record.version, 1);
        assert_eq!(log.last_version("claim-1"), 2);
    }

    #[test]
    fn append_writes_through_to_repository() {
        let (repo, log) = new_log();
        log.append(progress_draft("claim-1", 10)).unwrap();
        log.append(progress_draft("claim-1", 20)).unwrap();
        assert_eq!(repo.event_count(), 2);
    }

    #[test]
    fn stream_respects_from_version() {
        let (_repo, log) = new_log();
        for i in 1..=4u8 {
            log.append(progress_draft("claim-1", i * 10)).unwrap();
        }

        let tail = log.stream("claim-1", Some(3));
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].version, 3);

        assert!(log.stream("claim-missing", None).is_empty());
    }

    #[test]
    fn by_type_and_by_issue_filter() {
        let (_repo, log) = new_log();
        log.append(progress_draft("claim-1", 10)).unwrap();
        log.append(EventDraft::new(
            "claim-1",
            Some("issue-1".to_string()),
            EventPayload::ClaimCompleted {
                by: "agent:a1".to_string(),
            },
        ))
        .unwrap();
        log.append(progress_draft("claim-2", 30)).unwrap();

        assert_eq!(log.by_type("claim:progress-updated", None).len(), 2);
        assert_eq!(log.by_type("claim:completed", None).len(), 1);
        assert_eq!(log.by_issue("issue-1").len(), 3);
        assert!(log.by_issue("issue-2").is_empty());
    }

    #[test]
    fn timestamps_never_regress_within_an_aggregate() {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let log = EventLog::new(repo, clock.clone(), IdGen::new()).unwrap();

        let first = log.append(progress_draft("claim-1", 10)).unwrap();
        clock.set(first.timestamp - Duration::seconds(30));
        let second = log.append(progress_draft("claim-1", 20)).unwrap();

        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn hydration_restores_versions() {
        let repo = Arc::new(InMemoryRepository::new());
        {
            let log = EventLog::new(repo.clone(), Arc::new(SystemClock), IdGen::new()).unwrap();
            log.append(progress_draft("claim-1", 10)).unwrap();
            log.append(progress_draft("claim-1", 20)).unwrap();
        }

        let log = EventLog::new(repo, Arc::new(SystemClock), IdGen::new()).unwrap();
        assert_eq!(log.last_version("claim-1"), 2);
        let record = log.append(progress_draft("claim-1", 30)).unwrap();
        assert_eq!(record.version, 3);
    }
}
