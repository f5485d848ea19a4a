//! Contention scenarios: parallel callers racing on the same coordinator.

use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;

use swarm::catalog::InMemoryIssueCatalog;
use swarm::{
    ClaimPriority, Claimant, ClaimantKind, Coordinator, CoordinatorConfig, IssueRef,
};

fn coordinator_with_issues(count: usize) -> (Arc<InMemoryIssueCatalog>, Arc<Coordinator>) {
    let catalog = Arc::new(InMemoryIssueCatalog::new());
    for index in 0..count {
        catalog.insert(IssueRef {
            issue_id: format!("issue-{}", index),
            title: format!("Issue {}", index),
            priority: ClaimPriority::Medium,
            labels: vec![],
            repository: None,
        });
    }
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig {
            max_claims_per_agent: 100,
            ..Default::default()
        })
        .catalog(catalog.clone())
        .build()
        .unwrap();
    (catalog, Arc::new(coordinator))
}

fn agent(id: &str) -> Claimant {
    Claimant {
        id: id.to_string(),
        kind: ClaimantKind::Agent,
        agent_type: None,
        capabilities: vec![],
    }
}

#[test]
fn two_concurrent_claims_one_winner() {
    let (_catalog, coordinator) = coordinator_with_issues(1);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = ["agent:a1", "agent:a2"]
        .into_iter()
        .map(|claimant| {
            let coordinator = Arc::clone(&coordinator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coordinator.surface().call(
                    "issue_claim",
                    json!({
                        "issueId": "issue-0",
                        "claimantId": claimant,
                        "claimantKind": "agent",
                    }),
                )
            })
        })
        .collect();

    let responses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = responses.iter().filter(|r| r.ok).count();
    assert_eq!(winners, 1, "exactly one concurrent claim must win");

    let loser = responses.iter().find(|r| !r.ok).unwrap();
    assert_eq!(loser.error.as_ref().unwrap().kind, "already-claimed");

    // The issue's log holds a single creation event
    let created: Vec<_> = coordinator
        .event_log()
        .by_issue("issue-0")
        .into_iter()
        .filter(|record| record.kind() == "claim:created")
        .collect();
    assert_eq!(created.len(), 1);
}

#[test]
fn many_racers_on_one_issue_still_one_winner() {
    let (_catalog, coordinator) = coordinator_with_issues(1);
    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|index| {
            let coordinator = Arc::clone(&coordinator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coordinator
                    .manager()
                    .claim("issue-0", agent(&format!("agent:r{}", index)), None, None)
                    .is_ok()
            })
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(successes, 1);
}

#[test]
fn claims_on_distinct_issues_do_not_contend() {
    let issues = 12;
    let (_catalog, coordinator) = coordinator_with_issues(issues);
    let barrier = Arc::new(Barrier::new(issues));

    let handles: Vec<_> = (0..issues)
        .map(|index| {
            let coordinator = Arc::clone(&coordinator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coordinator
                    .manager()
                    .claim(
                        &format!("issue-{}", index),
                        agent(&format!("agent:w{}", index % 3)),
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
    assert_eq!(successes, issues);
}

#[test]
fn parallel_lifecycle_storm_keeps_invariants() {
    let issues = 8;
    let workers = 4;
    let (_catalog, coordinator) = coordinator_with_issues(issues);
    let barrier = Arc::new(Barrier::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let coordinator = Arc::clone(&coordinator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let me = format!("agent:w{}", worker);
                for round in 0..20 {
                    let issue = format!("issue-{}", (worker + round) % issues);
                    let _ = coordinator.manager().claim(&issue, agent(&me), None, None);
                    let _ = coordinator.manager().set_progress(&issue, &me, (round * 5) as u8);
                    let _ = coordinator.manager().release(&issue, &me, None);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Invariants after the storm: one non-terminal claim per issue at most,
    // replay agreement, and an honest load index
    let report = coordinator.verify_consistency();
    assert!(report.replay_mismatches.is_empty());
    assert!(!report.load_healed);

    for issue in 0..issues {
        let issue_id = format!("issue-{}", issue);
        let non_terminal: Vec<_> = coordinator
            .store()
            .all()
            .into_iter()
            .filter(|c| c.issue_id == issue_id && !c.is_terminal())
            .collect();
        assert!(non_terminal.len() <= 1);
    }
}

#[test]
fn subscribers_observe_per_issue_order() {
    let (_catalog, coordinator) = coordinator_with_issues(1);
    let events = coordinator.subscribe();

    coordinator
        .manager()
        .claim("issue-0", agent("agent:a1"), None, None)
        .unwrap();
    coordinator
        .manager()
        .set_progress("issue-0", "agent:a1", 50)
        .unwrap();
    coordinator
        .manager()
        .release("issue-0", "agent:a1", None)
        .unwrap();

    let kinds: Vec<String> = events.try_iter().map(|r| r.kind().to_string()).collect();
    assert_eq!(
        kinds,
        vec!["claim:created", "claim:progress-updated", "claim:released"]
    );
}
