//! Ecosystem lifecycle tests
//!
//! Services answer through `MockCaller` and processes go to a
//! `RecordingSupervisor`. Background intervals are long so every check and
//! evaluation in these tests is driven explicitly.

use armada_core::{
    CycleKind, EcosystemState, HealthConfig, OrchestratorConfig, ServiceDescriptor, ServiceState,
    StepSpec, WorkflowCycle, ENTITY_ECOSYSTEM_SNAPSHOT, METHOD_INITIALIZE,
};
use armada_fleet::{HealthMonitor, ServiceRegistry};
use armada_knowledge::KnowledgeStore;
use armada_orchestrator::{Components, Manifest, Orchestrator};
use armada_test_utils::fixtures::{local_service, remote_service};
use armada_test_utils::{MockCaller, MockReply, RecordingSupervisor, SupervisorAction};
use armada_workflow::WorkflowScheduler;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    caller: Arc<MockCaller>,
    supervisor: Arc<RecordingSupervisor>,
    store: Arc<KnowledgeStore>,
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        health: HealthConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(200),
        },
        error_grace_period: Duration::from_secs(60),
        handshake_timeout: Some(Duration::from_millis(200)),
        evaluation_interval: Duration::from_secs(3600),
        stop_grace: Duration::from_millis(100),
        ..OrchestratorConfig::default()
    }
}

fn harness(services: Vec<ServiceDescriptor>, cycles: Vec<WorkflowCycle>) -> Harness {
    let config = test_config();
    let registry = Arc::new(ServiceRegistry::from_descriptors(services).unwrap());
    let caller = Arc::new(MockCaller::new());
    let supervisor = Arc::new(RecordingSupervisor::new());
    let store = Arc::new(KnowledgeStore::in_memory());
    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        caller.clone(),
        supervisor.clone(),
        config.health.clone(),
    ));
    let scheduler = Arc::new(WorkflowScheduler::new(
        cycles,
        registry.clone(),
        caller.clone(),
        store.clone(),
    ));
    let components = Components {
        registry,
        caller: caller.clone(),
        supervisor: supervisor.clone(),
        monitor,
        store: store.clone(),
        scheduler,
    };
    Harness {
        orchestrator: Arc::new(Orchestrator::new(config, components).unwrap()),
        caller,
        supervisor,
        store,
    }
}

fn fleet() -> Vec<ServiceDescriptor> {
    vec![
        local_service("worker"),
        remote_service("reasoner")
            .with_capabilities(["analyze"])
            .required(),
    ]
}

fn learning_cycle() -> WorkflowCycle {
    WorkflowCycle::new("learn", Duration::from_secs(3600))
        .with_kind(CycleKind::Learning)
        .with_step(StepSpec::new("reasoner", "analyze"))
}

/// Drive the required `reasoner` into `error`; returns when it got there.
async fn fail_reasoner(h: &Harness, base: DateTime<Utc>) -> DateTime<Utc> {
    let reasoner = remote_service("reasoner").required();
    h.caller.script_health("reasoner", &[false, false, false]);
    for i in 0..3 {
        h.orchestrator
            .monitor()
            .check_service_at(&reasoner, base + ChronoDuration::seconds(i))
            .await;
    }
    let status = h.orchestrator.monitor().status("reasoner").unwrap();
    assert_eq!(status.state, ServiceState::Error);
    status.error_since.unwrap()
}

async fn wait_for_state(orchestrator: &Orchestrator, expected: EcosystemState) {
    let mut rx = orchestrator.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("never reached {}", expected))
        .unwrap();
}

#[tokio::test]
async fn test_start_launches_local_services_and_handshakes() {
    let h = harness(fleet(), vec![]);
    assert_eq!(h.orchestrator.state(), EcosystemState::Initializing);

    h.orchestrator.start().await.unwrap();

    assert_eq!(h.orchestrator.state(), EcosystemState::Active);
    assert_eq!(
        h.supervisor.actions(),
        vec![SupervisorAction::Start("worker".to_string())]
    );
    assert_eq!(h.caller.call_count("worker", METHOD_INITIALIZE), 1);
    assert_eq!(h.caller.call_count("reasoner", METHOD_INITIALIZE), 1);

    let init = h
        .caller
        .calls()
        .into_iter()
        .find(|c| c.method == METHOD_INITIALIZE)
        .unwrap();
    assert_eq!(init.params["orchestrator"], json!("armada"));

    for status in h.orchestrator.statuses() {
        assert_eq!(status.state, ServiceState::Active, "{}", status.name);
    }

    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_launch_skips_handshake() {
    let h = harness(fleet(), vec![]);
    h.supervisor.fail_spawns("worker");

    h.orchestrator.start().await.unwrap();

    assert_eq!(h.caller.call_count("worker", METHOD_INITIALIZE), 0);
    assert_eq!(h.caller.call_count("reasoner", METHOD_INITIALIZE), 1);
    // `worker` is not required, so the ecosystem still comes up.
    assert_eq!(h.orchestrator.state(), EcosystemState::Active);

    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_writes_one_snapshot_and_is_idempotent() {
    let mut services = fleet();
    services.push(local_service("indexer"));
    let h = harness(services, vec![learning_cycle()]);
    h.orchestrator.start().await.unwrap();

    // `indexer` fails its checks and cannot be relaunched.
    let indexer = local_service("indexer");
    h.supervisor.fail_spawns("indexer");
    h.caller.script_health("indexer", &[false, false, false]);
    let base = Utc::now();
    for i in 0..3 {
        h.orchestrator
            .monitor()
            .check_service_at(&indexer, base + ChronoDuration::seconds(i))
            .await;
    }
    assert_eq!(
        h.orchestrator.monitor().status("indexer").unwrap().state,
        ServiceState::Error
    );

    let report = h.orchestrator.shutdown().await.unwrap();

    assert_eq!(h.orchestrator.state(), EcosystemState::Shutdown);
    assert!(report.stop_failures.is_empty());
    let actions = h.supervisor.actions();
    assert!(actions.contains(&SupervisorAction::Stop("worker".to_string())));
    assert!(actions.contains(&SupervisorAction::Stop("indexer".to_string())));
    assert!(h.store.is_closed());

    let snapshots = h.store.entities_of_type(ENTITY_ECOSYSTEM_SNAPSHOT).unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(report.snapshot_id.as_deref(), Some(snapshots[0].id.as_str()));
    let observations = &snapshots[0].observations;
    assert!(observations[0].starts_with("uptime_secs="));
    assert_eq!(observations[1], "state_before_shutdown=active");
    assert!(observations.iter().any(|o| o.starts_with("service reasoner: state=active")));
    assert!(observations.iter().any(|o| o.starts_with("service worker: state=active")));
    assert!(observations.iter().any(|o| o.starts_with("service indexer: state=error")));
    assert!(observations
        .iter()
        .any(|o| o == "cycle learn: runs=0 failures=0 skipped=0"));

    let again = h.orchestrator.shutdown().await.unwrap();
    assert_eq!(again.snapshot_id, None);
    assert_eq!(
        h.store.entities_of_type(ENTITY_ECOSYSTEM_SNAPSHOT).unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_shutdown_without_start() {
    let h = harness(fleet(), vec![]);

    let report = h.orchestrator.shutdown().await.unwrap();

    assert!(report.snapshot_id.is_some());
    assert_eq!(h.orchestrator.state(), EcosystemState::Shutdown);
}

#[tokio::test]
async fn test_required_service_escalates_after_grace_and_recovers() {
    let h = harness(fleet(), vec![]);
    h.orchestrator.start().await.unwrap();

    let since = fail_reasoner(&h, Utc::now()).await;

    let within = since + ChronoDuration::seconds(30);
    assert_eq!(h.orchestrator.evaluate_at(within), EcosystemState::Active);

    let past = since + ChronoDuration::seconds(61);
    assert_eq!(h.orchestrator.evaluate_at(past), EcosystemState::Error);

    let reasoner = remote_service("reasoner").required();
    h.caller.push_reply("reasoner", "health", MockReply::healthy());
    h.orchestrator
        .monitor()
        .check_service_at(&reasoner, past + ChronoDuration::seconds(1))
        .await;

    let now = past + ChronoDuration::seconds(2);
    assert_eq!(h.orchestrator.evaluate_at(now), EcosystemState::Active);

    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_optional_service_never_escalates() {
    let services = vec![remote_service("cache"), remote_service("reasoner").required()];
    let h = harness(services, vec![]);
    h.orchestrator.start().await.unwrap();

    let cache = remote_service("cache");
    h.caller.script_health("cache", &[false, false, false]);
    let base = Utc::now();
    for i in 0..3 {
        h.orchestrator
            .monitor()
            .check_service_at(&cache, base + ChronoDuration::seconds(i))
            .await;
    }

    let later = base + ChronoDuration::hours(1);
    assert_eq!(h.orchestrator.evaluate_at(later), EcosystemState::Active);

    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_learning_cycle_drives_state() {
    let h = harness(fleet(), vec![learning_cycle()]);
    h.caller.respond(
        "reasoner",
        "analyze",
        MockReply::Value(json!({"facts": []})).delayed(Duration::from_millis(300)),
    );
    h.orchestrator.start().await.unwrap();

    let scheduler = h.orchestrator.scheduler().clone();
    let run = tokio::spawn(async move { scheduler.run_now("learn").await });

    wait_for_state(&h.orchestrator, EcosystemState::Learning).await;
    assert!(run.await.unwrap().unwrap().is_success());
    wait_for_state(&h.orchestrator, EcosystemState::Active).await;

    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cycles_do_not_leave_error_state() {
    let h = harness(fleet(), vec![learning_cycle()]);
    h.orchestrator.start().await.unwrap();

    let since = fail_reasoner(&h, Utc::now()).await;
    assert_eq!(
        h.orchestrator
            .evaluate_at(since + ChronoDuration::seconds(120)),
        EcosystemState::Error
    );

    h.orchestrator.scheduler().run_now("learn").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.orchestrator.state(), EcosystemState::Error);
    h.orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let registry = Arc::new(ServiceRegistry::from_descriptors(vec![]).unwrap());
    let caller = Arc::new(MockCaller::new());
    let supervisor = Arc::new(RecordingSupervisor::new());
    let store = Arc::new(KnowledgeStore::in_memory());
    let config = OrchestratorConfig {
        stop_grace: Duration::ZERO,
        ..test_config()
    };
    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        caller.clone(),
        supervisor.clone(),
        config.health.clone(),
    ));
    let scheduler = Arc::new(WorkflowScheduler::new(
        vec![],
        registry.clone(),
        caller.clone(),
        store.clone(),
    ));
    let components = Components {
        registry,
        caller,
        supervisor,
        monitor,
        store,
        scheduler,
    };

    assert!(Orchestrator::new(config, components).is_err());
}

#[tokio::test]
async fn test_snapshot_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let text = format!(
        "[orchestrator]\nstore_path = {:?}\nhandshake_timeout_ms = 0\n",
        dir.path().join("knowledge").display().to_string()
    );
    let resolved = Manifest::parse(&text).unwrap().resolve().unwrap();
    let orchestrator = Arc::new(Orchestrator::assemble(resolved, Arc::new(MockCaller::new())).unwrap());

    orchestrator.start().await.unwrap();
    orchestrator.shutdown().await.unwrap();
    drop(orchestrator);

    let reopened = KnowledgeStore::open(&armada_core::StoreConfig {
        path: Some(dir.path().join("knowledge")),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(
        reopened
            .entities_of_type(ENTITY_ECOSYSTEM_SNAPSHOT)
            .unwrap()
            .len(),
        1
    );
}
