//! Property-based tests for coordination invariants.
//!
//! These use `proptest` to drive the coordinator through random operation
//! traces and check the structural invariants that example-based tests cannot
//! cover exhaustively: single non-terminal claim per issue, gap-free event
//! versions, and projection/replay agreement.

use super::*;
use crate::catalog::IssueRef;
use crate::clock::ManualClock;
use crate::domain::{ClaimPriority, ClaimStatus, Claimant, ClaimantKind, StealableReason};
use proptest::prelude::*;
use std::collections::HashMap;

const ISSUES: usize = 4;
const WORKERS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Claim(usize, usize),
    Release(usize, usize),
    Pause(usize, usize),
    Resume(usize, usize),
    Block(usize, usize),
    Progress(usize, usize, u8),
    Mark(usize, usize),
    Steal(usize, usize),
    AdvanceMinutes(u8),
    ExpiryPass,
}

fn issue_id(index: usize) -> String {
    format!("issue-{}", index % ISSUES)
}

fn worker_id(index: usize) -> String {
    format!("agent:w{}", index % WORKERS)
}

fn worker(index: usize) -> Claimant {
    Claimant {
        id: worker_id(index),
        kind: ClaimantKind::Agent,
        agent_type: Some("coder".to_string()),
        capabilities: vec![],
    }
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..ISSUES, 0..WORKERS).prop_map(|(i, w)| Op::Claim(i, w)),
        (0..ISSUES, 0..WORKERS).prop_map(|(i, w)| Op::Release(i, w)),
        (0..ISSUES, 0..WORKERS).prop_map(|(i, w)| Op::Pause(i, w)),
        (0..ISSUES, 0..WORKERS).prop_map(|(i, w)| Op::Resume(i, w)),
        (0..ISSUES, 0..WORKERS).prop_map(|(i, w)| Op::Block(i, w)),
        (0..ISSUES, 0..WORKERS, 0u8..=100).prop_map(|(i, w, p)| Op::Progress(i, w, p)),
        (0..ISSUES, 0..WORKERS).prop_map(|(i, w)| Op::Mark(i, w)),
        (0..ISSUES, 0..WORKERS).prop_map(|(i, w)| Op::Steal(i, w)),
        (1u8..30).prop_map(Op::AdvanceMinutes),
        Just(Op::ExpiryPass),
    ]
}

fn build_coordinator() -> (std::sync::Arc<ManualClock>, Coordinator) {
    let clock = std::sync::Arc::new(ManualClock::new(chrono::Utc::now()));
    let catalog = std::sync::Arc::new(InMemoryIssueCatalog::new());
    for index in 0..ISSUES {
        catalog.insert(IssueRef {
            issue_id: issue_id(index),
            title: format!("Issue {}", index),
            priority: ClaimPriority::Medium,
            labels: vec![],
            repository: None,
        });
    }
    let coordinator = Coordinator::builder()
        .clock(clock.clone())
        .catalog(catalog)
        .build()
        .unwrap();
    (clock, coordinator)
}

/// Drive one operation; rule violations are expected and ignored.
fn run_op(clock: &ManualClock, coordinator: &Coordinator, op: &Op) {
    let manager = coordinator.manager();
    match op {
        Op::Claim(i, w) => {
            let _ = manager.claim(&issue_id(*i), worker(*w), None, Some(90 * 60 * 1000));
        }
        Op::Release(i, w) => {
            let _ = manager.release(&issue_id(*i), &worker_id(*w), None);
        }
        Op::Pause(i, w) => {
            let _ = manager.update_status(
                &issue_id(*i),
                &worker_id(*w),
                ClaimStatus::Paused,
                None,
                None,
            );
        }
        Op::Resume(i, w) => {
            let _ = manager.update_status(
                &issue_id(*i),
                &worker_id(*w),
                ClaimStatus::Active,
                None,
                None,
            );
        }
        Op::Block(i, w) => {
            let _ = manager.update_status(
                &issue_id(*i),
                &worker_id(*w),
                ClaimStatus::Blocked,
                Some("blocked".to_string()),
                None,
            );
        }
        Op::Progress(i, w, p) => {
            let _ = manager.set_progress(&issue_id(*i), &worker_id(*w), *p);
        }
        Op::Mark(i, w) => {
            let _ = coordinator.steal_engine().mark_stealable(
                &issue_id(*i),
                &worker_id(*w),
                StealableReason::Manual,
            );
        }
        Op::Steal(i, w) => {
            let _ = coordinator
                .steal_engine()
                .steal(&issue_id(*i), worker(*w), None);
        }
        Op::AdvanceMinutes(minutes) => {
            clock.advance(chrono::Duration::minutes(*minutes as i64));
        }
        Op::ExpiryPass => {
            coordinator.run_expiry_pass();
        }
    }
}

// Property 1: at most one non-terminal claim per issue, ever.
proptest! {
    #[test]
    fn prop_single_non_terminal_claim_per_issue(
        ops in prop::collection::vec(op_strategy(), 1..60)
    ) {
        let (clock, coordinator) = build_coordinator();
        for op in &ops {
            run_op(&clock, &coordinator, op);

            let mut non_terminal: HashMap<String, usize> = HashMap::new();
            for claim in coordinator.store().all() {
                if !claim.is_terminal() {
                    *non_terminal.entry(claim.issue_id.clone()).or_default() += 1;
                }
            }
            for (issue, count) in &non_terminal {
                prop_assert!(
                    *count <= 1,
                    "issue {} has {} non-terminal claims after {:?}",
                    issue, count, op
                );
            }
        }
    }
}

// Properties 2 and 8: replaying each claim's stream reproduces the projection
// exactly, and the load index matches a recount from the store.
proptest! {
    #[test]
    fn prop_projection_equals_replay(
        ops in prop::collection::vec(op_strategy(), 1..60)
    ) {
        let (clock, coordinator) = build_coordinator();
        for op in &ops {
            run_op(&clock, &coordinator, op);
        }

        let report = coordinator.verify_consistency();
        prop_assert!(
            report.replay_mismatches.is_empty(),
            "projection diverged for {:?}",
            report.replay_mismatches
        );
        prop_assert!(!report.load_healed, "load index diverged from store");
    }
}

// Property 3: per-aggregate versions are the consecutive sequence 1..n.
proptest! {
    #[test]
    fn prop_versions_are_gap_free(
        ops in prop::collection::vec(op_strategy(), 1..60)
    ) {
        let (clock, coordinator) = build_coordinator();
        for op in &ops {
            run_op(&clock, &coordinator, op);
        }

        let mut streams: HashMap<String, Vec<u64>> = HashMap::new();
        for record in coordinator.event_log().all() {
            streams
                .entry(record.aggregate_id.clone())
                .or_default()
                .push(record.version);
        }
        for (aggregate, versions) in &streams {
            let expected: Vec<u64> = (1..=versions.len() as u64).collect();
            prop_assert_eq!(
                versions, &expected,
                "aggregate {} has gapped versions", aggregate
            );
        }
    }
}

// Property 4: a successful steal terminates the predecessor as stolen and
// carries progress and priority onto the new claim.
proptest! {
    #[test]
    fn prop_steal_preserves_progress_and_priority(
        progress in 0u8..75,
        minutes in 11u8..60
    ) {
        let (clock, coordinator) = build_coordinator();
        let manager = coordinator.manager();
        manager.claim(&issue_id(0), worker(0), None, None).unwrap();
        manager.set_progress(&issue_id(0), &worker_id(0), progress).unwrap();

        clock.advance(chrono::Duration::minutes(minutes as i64));
        coordinator
            .steal_engine()
            .mark_stealable(&issue_id(0), &worker_id(0), StealableReason::Manual)
            .unwrap();
        let outcome = coordinator
            .steal_engine()
            .steal(&issue_id(0), worker(1), None)
            .unwrap();

        prop_assert_eq!(outcome.new_claim.progress, progress);
        prop_assert_eq!(outcome.new_claim.priority, ClaimPriority::Medium);
        let previous = coordinator
            .store()
            .get(&outcome.new_claim.steal_origin.as_ref().unwrap().previous_claim_id)
            .unwrap();
        prop_assert_eq!(previous.status, ClaimStatus::Stolen);
    }
}

// Concurrency: many threads racing for one issue yield exactly one claim.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]
    #[test]
    fn prop_concurrent_claims_exclusive(thread_count in 2usize..16) {
        let (_clock, coordinator) = build_coordinator();
        let coordinator = std::sync::Arc::new(coordinator);

        let handles: Vec<_> = (0..thread_count)
            .map(|index| {
                let coordinator = std::sync::Arc::clone(&coordinator);
                std::thread::spawn(move || {
                    coordinator
                        .manager()
                        .claim(
                            &issue_id(0),
                            Claimant {
                                id: format!("agent:racer-{}", index),
                                kind: ClaimantKind::Agent,
                                agent_type: None,
                                capabilities: vec![],
                            },
                            None,
                            None,
                        )
                        .is_ok()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|ok| *ok)
            .count();
        prop_assert_eq!(successes, 1, "exactly one racer should win the claim");
    }
}
