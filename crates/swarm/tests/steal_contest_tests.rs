//! Steal and contest scenarios: grace periods, contest windows, reversal.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use swarm::catalog::InMemoryIssueCatalog;
use swarm::domain::{ContestResolution, StealableReason};
use swarm::{
    ClaimPriority, ClaimStatus, Claimant, ClaimantKind, Coordinator, CoordinatorConfig, IssueRef,
    ManualClock,
};

struct Harness {
    clock: Arc<ManualClock>,
    catalog: Arc<InMemoryIssueCatalog>,
    coordinator: Coordinator,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let catalog = Arc::new(InMemoryIssueCatalog::new());
    let coordinator = Coordinator::builder()
        .config(CoordinatorConfig::default())
        .clock(clock.clone())
        .catalog(catalog.clone())
        .build()
        .unwrap();
    Harness {
        clock,
        catalog,
        coordinator,
    }
}

fn seed_issue(harness: &Harness, issue_id: &str) {
    harness.catalog.insert(IssueRef {
        issue_id: issue_id.to_string(),
        title: format!("Issue {}", issue_id),
        priority: ClaimPriority::Medium,
        labels: vec![],
        repository: None,
    });
}

fn coder(id: &str) -> Claimant {
    Claimant {
        id: id.to_string(),
        kind: ClaimantKind::Agent,
        agent_type: Some("coder".to_string()),
        capabilities: vec![],
    }
}

#[test]
fn steal_within_grace_fails_then_succeeds_after() {
    let h = harness();
    seed_issue(&h, "issue-1");
    let surface = h.coordinator.surface();

    surface.call(
        "issue_claim",
        json!({"issueId": "issue-1", "claimantId": "agent:a1", "claimantKind": "agent", "agentType": "coder"}),
    );

    // One minute in: marking is refused, the grace period still runs
    h.clock.advance(Duration::minutes(1));
    let response = surface.call(
        "issue_mark_stealable",
        json!({"issueId": "issue-1", "claimantId": "agent:a1"}),
    );
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().kind, "in-grace");

    // Eleven minutes in: marking succeeds, then the steal goes through
    h.clock.advance(Duration::minutes(10));
    let response = surface.call(
        "issue_mark_stealable",
        json!({"issueId": "issue-1", "claimantId": "agent:a1"}),
    );
    assert!(response.ok);
    assert_eq!(response.data.unwrap()["marked"], true);

    let response = surface.call(
        "issue_steal",
        json!({
            "issueId": "issue-1",
            "stealerId": "agent:a2",
            "stealerKind": "agent",
            "stealerType": "coder",
        }),
    );
    assert!(response.ok);
    let data = response.data.unwrap();
    assert_eq!(data["stolen"], true);
    assert_eq!(data["previousClaimant"], "agent:a1");
    assert_eq!(data["contestWindowMs"], 300_000);
}

#[test]
fn contest_reverses_steal_when_challenger_wins() {
    let h = harness();
    seed_issue(&h, "issue-1");
    let manager = h.coordinator.manager();
    let engine = h.coordinator.steal_engine();

    manager.claim("issue-1", coder("agent:a1"), None, None).unwrap();
    manager.set_progress("issue-1", "agent:a1", 35).unwrap();
    h.clock.advance(Duration::minutes(11));
    engine
        .mark_stealable("issue-1", "agent:a1", StealableReason::Manual)
        .unwrap();
    engine.steal("issue-1", coder("agent:a2"), None).unwrap();

    // Two minutes into the five-minute window the displaced holder contests
    h.clock.advance(Duration::minutes(2));
    let response = h.coordinator.surface().call(
        "issue_contest_steal",
        json!({
            "issueId": "issue-1",
            "contesterId": "agent:a1",
            "reason": "actively working",
        }),
    );
    assert!(response.ok);
    let data = response.data.unwrap();
    assert_eq!(data["status"], "pending");
    let contest_id = data["contestId"].as_str().unwrap().to_string();

    // An external resolver sides with the challenger
    let outcome = engine
        .resolve_contest(&contest_id, ContestResolution::Reversed, Some("human:lead"))
        .unwrap();
    let reinstated = outcome.reinstated.unwrap();
    assert_eq!(reinstated.claimant.id, "agent:a1");
    assert_eq!(reinstated.progress, 35);

    // The thief's claim ended released with cause contest
    let released: Vec<_> = h
        .coordinator
        .store()
        .all()
        .into_iter()
        .filter(|c| c.status == ClaimStatus::Released)
        .collect();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].claimant.id, "agent:a2");
}

#[test]
fn uncontested_window_resolves_for_defender() {
    let h = harness();
    seed_issue(&h, "issue-1");
    let manager = h.coordinator.manager();
    let engine = h.coordinator.steal_engine();

    manager.claim("issue-1", coder("agent:a1"), None, None).unwrap();
    h.clock.advance(Duration::minutes(11));
    engine
        .mark_stealable("issue-1", "agent:a1", StealableReason::Manual)
        .unwrap();
    engine.steal("issue-1", coder("agent:a2"), None).unwrap();
    h.clock.advance(Duration::minutes(1));
    engine
        .contest("issue-1", "agent:a1", "still working")
        .unwrap();

    // Nobody resolves; the scanner closes the window for the defender
    h.clock.advance(Duration::minutes(5));
    let summary = h.coordinator.run_expiry_pass();
    assert_eq!(summary.contests_resolved, 1);

    let claim = h.coordinator.store().active_claim("issue-1").unwrap();
    assert_eq!(claim.claimant.id, "agent:a2");
    assert_eq!(
        claim.contest.unwrap().resolution,
        Some(ContestResolution::Upheld)
    );
}

#[test]
fn stealable_listing_is_priority_ordered_through_the_surface() {
    let h = harness();
    for (issue, priority) in [
        ("issue-low", ClaimPriority::Low),
        ("issue-high", ClaimPriority::High),
    ] {
        h.catalog.insert(IssueRef {
            issue_id: issue.to_string(),
            title: issue.to_string(),
            priority,
            labels: vec![],
            repository: None,
        });
        h.coordinator
            .manager()
            .claim(issue, coder(&format!("agent:{}", issue)), None, None)
            .unwrap();
    }
    h.clock.advance(Duration::minutes(11));
    for issue in ["issue-low", "issue-high"] {
        h.coordinator
            .steal_engine()
            .mark_stealable(issue, &format!("agent:{}", issue), StealableReason::Manual)
            .unwrap();
    }

    let response = h.coordinator.surface().call("issue_get_stealable", json!({}));
    let data = response.data.unwrap();
    let issues: Vec<&str> = data["stealable"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["issueId"].as_str().unwrap())
        .collect();
    assert_eq!(issues, vec!["issue-high", "issue-low"]);
}

#[test]
fn driver_marks_stale_claim_which_is_then_stolen() {
    let h = harness();
    seed_issue(&h, "issue-1");
    let manager = h.coordinator.manager();

    manager.claim("issue-1", coder("agent:a1"), None, None).unwrap();

    // 31 idle minutes: the scanner marks the claim stale
    h.clock.advance(Duration::minutes(31));
    let summary = h.coordinator.run_expiry_pass();
    assert_eq!(summary.marked_stealable, 1);

    let claim = h.coordinator.store().active_claim("issue-1").unwrap();
    assert_eq!(claim.status, ClaimStatus::Stealable);
    assert_eq!(claim.stealable.as_ref().unwrap().reason, StealableReason::Stale);

    let outcome = h
        .coordinator
        .steal_engine()
        .steal("issue-1", coder("agent:a2"), Some("stale takeover".to_string()))
        .unwrap();
    assert_eq!(outcome.previous_claimant, "agent:a1");
}

#[test]
fn progress_protection_holds_even_after_marking() {
    let h = harness();
    seed_issue(&h, "issue-1");
    let manager = h.coordinator.manager();
    let engine = h.coordinator.steal_engine();

    manager.claim("issue-1", coder("agent:a1"), None, None).unwrap();
    h.clock.advance(Duration::minutes(11));
    engine
        .mark_stealable("issue-1", "agent:a1", StealableReason::Manual)
        .unwrap();

    // Holder pushes past the protection threshold while marked
    manager.set_progress("issue-1", "agent:a1", 80).unwrap();

    let response = h.coordinator.surface().call(
        "issue_steal",
        json!({"issueId": "issue-1", "stealerId": "agent:a2", "stealerKind": "agent"}),
    );
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().kind, "protected-by-progress");
}

#[test]
fn stolen_claim_history_spans_both_claims() {
    let h = harness();
    seed_issue(&h, "issue-1");
    let manager = h.coordinator.manager();
    let engine = h.coordinator.steal_engine();

    manager.claim("issue-1", coder("agent:a1"), None, None).unwrap();
    h.clock.advance(Duration::minutes(11));
    engine
        .mark_stealable("issue-1", "agent:a1", StealableReason::Manual)
        .unwrap();
    engine.steal("issue-1", coder("agent:a2"), None).unwrap();

    let kinds: Vec<String> = h
        .coordinator
        .event_log()
        .by_issue("issue-1")
        .iter()
        .map(|record| record.kind().to_string())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "claim:created",
            "steal:issue-marked-stealable",
            "steal:issue-stolen",
            "claim:created",
        ]
    );
}
