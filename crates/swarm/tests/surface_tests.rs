//! Tool-surface conformance: schemas, validation, config, and read models.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use swarm::catalog::InMemoryIssueCatalog;
use swarm::{
    ClaimPriority, Claimant, ClaimantKind, Coordinator, CoordinatorConfig, IssueRef, ManualClock,
    ToolSurface,
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

fn seed_issue(h: &Harness, issue_id: &str, priority: ClaimPriority, labels: Vec<String>) {
    h.catalog.insert(IssueRef {
        issue_id: issue_id.to_string(),
        title: format!("Issue {}", issue_id),
        priority,
        labels,
        repository: Some("core".to_string()),
    });
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
fn every_documented_operation_dispatches() {
    let h = harness();
    seed_issue(&h, "issue-1", ClaimPriority::Medium, vec![]);
    let surface = h.coordinator.surface();

    // Operations that only need an empty or trivial input must not hit the
    // unknown-operation path
    for (operation, input) in [
        ("issue_list_available", json!({})),
        ("issue_board", json!({})),
        ("issue_get_stealable", json!({})),
        ("swarm_load_overview", json!({})),
        ("claim_metrics", json!({})),
        ("swarm_rebalance", json!({"dryRun": true})),
        ("claim_config", json!({"action": "get"})),
        ("issue_list_mine", json!({"claimantId": "agent:a1"})),
        ("agent_load_info", json!({"agentId": "agent:a1"})),
        ("claim_history", json!({"issueId": "issue-1"})),
    ] {
        let response = surface.call(operation, input);
        assert!(response.ok, "operation {} failed", operation);
    }
}

#[test]
fn list_available_filters_compose() {
    let h = harness();
    seed_issue(&h, "issue-1", ClaimPriority::High, vec!["rust".to_string()]);
    seed_issue(&h, "issue-2", ClaimPriority::High, vec![]);
    seed_issue(&h, "issue-3", ClaimPriority::Low, vec!["rust".to_string()]);
    let surface = h.coordinator.surface();

    let response = surface.call(
        "issue_list_available",
        json!({"priority": "high", "labels": ["rust"]}),
    );
    let data = response.data.unwrap();
    assert_eq!(data["total"], 1);
    assert_eq!(data["issues"][0]["issueId"], "issue-1");

    let response = surface.call(
        "issue_list_available",
        json!({"repository": "elsewhere"}),
    );
    assert_eq!(response.data.unwrap()["total"], 0);

    // Pagination reports the unpaginated total
    let response = surface.call("issue_list_available", json!({"limit": 1, "offset": 1}));
    let data = response.data.unwrap();
    assert_eq!(data["total"], 3);
    assert_eq!(data["issues"].as_array().unwrap().len(), 1);
}

#[test]
fn board_groups_and_counts_by_claimant() {
    let h = harness();
    for index in 0..3 {
        seed_issue(&h, &format!("issue-{}", index), ClaimPriority::Medium, vec![]);
    }
    h.coordinator
        .manager()
        .claim("issue-0", agent("agent:a1"), None, None)
        .unwrap();
    h.coordinator
        .manager()
        .claim("issue-1", agent("agent:a1"), None, None)
        .unwrap();
    h.coordinator
        .manager()
        .claim(
            "issue-2",
            Claimant {
                id: "human:alice".to_string(),
                kind: ClaimantKind::Human,
                agent_type: None,
                capabilities: vec![],
            },
            None,
            None,
        )
        .unwrap();

    let surface = h.coordinator.surface();
    let response = surface.call("issue_board", json!({}));
    let data = response.data.unwrap();
    assert_eq!(data["counts"]["agent:a1"], 2);
    assert_eq!(data["counts"]["human:alice"], 1);

    // Humans can be filtered out
    let response = surface.call("issue_board", json!({"includeHumans": false}));
    let data = response.data.unwrap();
    assert!(data["counts"].get("human:alice").is_none());
}

#[test]
fn metrics_windows_slice_history() {
    let h = harness();
    seed_issue(&h, "issue-1", ClaimPriority::Medium, vec![]);
    seed_issue(&h, "issue-2", ClaimPriority::Medium, vec![]);
    let surface = h.coordinator.surface();
    let manager = h.coordinator.manager();

    manager.claim("issue-1", agent("agent:a1"), None, None).unwrap();
    manager
        .update_status("issue-1", "agent:a1", swarm::ClaimStatus::Completed, None, None)
        .unwrap();

    // Two days later, a second claim
    h.clock.advance(Duration::hours(48));
    manager.claim("issue-2", agent("agent:a1"), None, None).unwrap();

    let response = surface.call("claim_metrics", json!({"timeRange": "all"}));
    let data = response.data.unwrap();
    assert_eq!(data["claimsCreated"], 2);
    assert_eq!(data["claimsCompleted"], 1);

    let response = surface.call("claim_metrics", json!({"timeRange": "24h"}));
    let data = response.data.unwrap();
    assert_eq!(data["claimsCreated"], 1);
    assert_eq!(data["claimsCompleted"], 0);
    assert_eq!(data["currentByStatus"]["active"], 1);
}

#[test]
fn config_round_trips_and_guards_unknown_keys() {
    let h = harness();
    let surface = h.coordinator.surface();

    let response = surface.call("claim_config", json!({"action": "get"}));
    let config = response.data.unwrap()["config"].clone();
    assert_eq!(config["gracePeriodMinutes"], 10);
    assert_eq!(config["crossTypeStealRules"][0][0], "coder");

    let response = surface.call(
        "claim_config",
        json!({"action": "set", "config": {"staleThresholdMinutes": 45, "allowCrossTypeSteal": false}}),
    );
    assert!(response.ok);
    assert_eq!(h.coordinator.config().get().stale_threshold_minutes, 45);
    assert!(!h.coordinator.config().get().allow_cross_type_steal);

    let response = surface.call(
        "claim_config",
        json!({"action": "set", "config": {"staleMinutes": 45}}),
    );
    assert!(!response.ok);
    // The failed update changed nothing
    assert_eq!(h.coordinator.config().get().stale_threshold_minutes, 45);
}

#[test]
fn config_file_feeds_the_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("swarm.toml");
    std::fs::write(
        &path,
        "gracePeriodMinutes = 1\ncontestWindowMs = 120000\n",
    )
    .unwrap();

    let config = CoordinatorConfig::from_file(&path).unwrap();
    let coordinator = Coordinator::builder().config(config).build().unwrap();
    assert_eq!(coordinator.config().get().grace_period_minutes, 1);
    assert_eq!(coordinator.config().get().contest_window_ms, 120_000);
}

#[test]
fn schema_enumerates_operations_and_option_sets() {
    let h = harness();
    let schema = h.coordinator.surface().schema();

    for operation in ToolSurface::OPERATIONS {
        assert!(schema["operations"].get(operation).is_some());
    }
    assert_eq!(
        schema["operations"]["swarm_rebalance"]["strategies"],
        json!(["round-robin", "least-loaded", "priority-based", "capability-based"])
    );
    assert_eq!(
        schema["priorities"],
        json!(["critical", "high", "medium", "low"])
    );
}

/// Repository whose event writes stall, stretching the critical section.
struct SlowRepository {
    inner: swarm::InMemoryRepository,
    delay: std::time::Duration,
}

impl swarm::ClaimRepository for SlowRepository {
    fn save_claim(&self, claim: &swarm::Claim) -> swarm::CoordResult<()> {
        self.inner.save_claim(claim)
    }

    fn load_claims(&self) -> swarm::CoordResult<Vec<swarm::Claim>> {
        self.inner.load_claims()
    }

    fn append_event(&self, record: &swarm::EventRecord) -> swarm::CoordResult<()> {
        std::thread::sleep(self.delay);
        self.inner.append_event(record)
    }

    fn read_events(&self) -> swarm::CoordResult<Vec<swarm::EventRecord>> {
        self.inner.read_events()
    }
}

#[test]
fn deadline_missed_before_critical_section_is_a_timeout() {
    let catalog = Arc::new(InMemoryIssueCatalog::new());
    catalog.insert(IssueRef {
        issue_id: "issue-1".to_string(),
        title: "Issue".to_string(),
        priority: ClaimPriority::Medium,
        labels: vec![],
        repository: None,
    });
    let coordinator = Arc::new(
        Coordinator::builder()
            .config(CoordinatorConfig {
                op_timeout_ms: 50,
                ..Default::default()
            })
            .repository(Arc::new(SlowRepository {
                inner: swarm::InMemoryRepository::new(),
                delay: std::time::Duration::from_millis(400),
            }))
            .catalog(catalog)
            .build()
            .unwrap(),
    );

    // First caller enters the critical section and stalls inside it
    let first = {
        let coordinator = Arc::clone(&coordinator);
        std::thread::spawn(move || {
            coordinator
                .manager()
                .claim("issue-1", agent("agent:a1"), None, None)
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(100));

    // Second caller cannot enter before its deadline and emits nothing
    let response = coordinator.surface().call(
        "issue_claim",
        json!({"issueId": "issue-1", "claimantId": "agent:a2", "claimantKind": "agent"}),
    );
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().kind, "timeout");

    // The stalled caller still completes normally; only its event exists
    assert!(first.join().unwrap().is_ok());
    assert_eq!(coordinator.event_log().all().len(), 1);
}
