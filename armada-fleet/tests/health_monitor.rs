//! Health monitor lifecycle tests
//!
//! Health outcomes are scripted through `MockCaller`; restarts go to a
//! `RecordingSupervisor`. Check times are synthetic so cooldowns can be
//! exercised without sleeping.

use armada_core::{HealthConfig, RestartPolicy, ServiceDescriptor, ServiceState};
use armada_fleet::{HealthEvent, HealthMonitor, ServiceRegistry};
use armada_test_utils::assertions::assert_state;
use armada_test_utils::fixtures::{local_service, remote_service};
use armada_test_utils::generators::arb_health_outcomes;
use armada_test_utils::{MockCaller, MockReply, RecordingSupervisor, SupervisorAction};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Harness {
    monitor: Arc<HealthMonitor>,
    caller: Arc<MockCaller>,
    supervisor: Arc<RecordingSupervisor>,
}

fn harness(services: Vec<ServiceDescriptor>) -> Harness {
    harness_with(
        services,
        HealthConfig {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(20),
        },
    )
}

fn harness_with(services: Vec<ServiceDescriptor>, config: HealthConfig) -> Harness {
    let registry = Arc::new(ServiceRegistry::from_descriptors(services).unwrap());
    let caller = Arc::new(MockCaller::new());
    let supervisor = Arc::new(RecordingSupervisor::new());
    let monitor = Arc::new(HealthMonitor::new(
        registry,
        caller.clone(),
        supervisor.clone(),
        config,
    ));
    Harness {
        monitor,
        caller,
        supervisor,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::seconds(secs)
}

#[tokio::test]
async fn test_healthy_fleet_is_active() {
    let h = harness(vec![local_service("a"), remote_service("b")]);

    let statuses = h.monitor.poll_once_at(at(0)).await;

    assert_eq!(statuses.len(), 2);
    for status in &statuses {
        assert_state(status, ServiceState::Active);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.last_check, Some(at(0)));
    }
    assert!(h.supervisor.actions().is_empty());
    assert_eq!(h.monitor.metrics().checks, 2);
}

#[tokio::test]
async fn test_degraded_counts_as_passing() {
    let h = harness(vec![local_service("a")]);
    h.caller.respond("a", "health", MockReply::degraded());

    let statuses = h.monitor.poll_once_at(at(0)).await;
    assert_state(&statuses[0], ServiceState::Active);
}

#[tokio::test]
async fn test_malformed_health_payload_is_a_failure() {
    let h = harness(vec![local_service("a")]);
    h.caller
        .respond("a", "health", MockReply::Value(serde_json::json!({"ok": true})));

    let statuses = h.monitor.poll_once_at(at(0)).await;
    assert_state(&statuses[0], ServiceState::Unhealthy);
    assert!(statuses[0].last_error.is_some());
}

#[tokio::test]
async fn test_flapping_service_never_reaches_error() {
    let h = harness(vec![local_service("flappy")]);
    h.caller
        .script_health("flappy", &[false, false, true, false, false, true, false, false]);

    for i in 0..8 {
        h.monitor.poll_once_at(at(i)).await;
    }

    let status = h.monitor.status("flappy").unwrap();
    assert_state(&status, ServiceState::Unhealthy);
    assert_eq!(status.consecutive_failures, 2);
    assert_eq!(h.supervisor.restarts_of("flappy"), 0);
}

#[tokio::test]
async fn test_three_failures_restart_once_within_cooldown() {
    let h = harness(vec![local_service("worker")]);
    h.caller
        .respond("worker", "health", MockReply::timeout("worker", "health"));

    // Three failures at t=0,10,20 reach the threshold and trigger a restart.
    for secs in [0, 10, 20] {
        h.monitor.poll_once_at(at(secs)).await;
    }
    let status = h.monitor.status("worker").unwrap();
    assert_state(&status, ServiceState::Starting);
    assert_eq!(status.last_restart, Some(at(20)));
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(h.supervisor.restarts_of("worker"), 1);

    // Another three failures inside the 60 s cooldown leave it in error.
    for secs in [30, 40, 50] {
        h.monitor.poll_once_at(at(secs)).await;
    }
    let status = h.monitor.status("worker").unwrap();
    assert_state(&status, ServiceState::Error);
    assert_eq!(h.supervisor.restarts_of("worker"), 1);

    // Once the cooldown has elapsed the next failing check restarts again.
    h.monitor.poll_once_at(at(81)).await;
    assert_eq!(h.supervisor.restarts_of("worker"), 2);
    assert_state(&h.monitor.status("worker").unwrap(), ServiceState::Starting);
}

#[tokio::test]
async fn test_recovery_resets_counters() {
    let h = harness(vec![local_service("worker")]);
    h.caller.script_health("worker", &[false, false, false, true]);

    for secs in 0..4 {
        h.monitor.poll_once_at(at(secs)).await;
    }

    let status = h.monitor.status("worker").unwrap();
    assert_state(&status, ServiceState::Active);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.restart_attempts, 0);
    assert!(status.error_since.is_none());
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_external_service_is_never_restarted() {
    let h = harness(vec![remote_service("graph").required()]);
    h.caller
        .respond("graph", "health", MockReply::timeout("graph", "health"));

    for secs in (0..10).map(|i| i * 100) {
        h.monitor.poll_once_at(at(secs)).await;
    }

    let status = h.monitor.status("graph").unwrap();
    assert_state(&status, ServiceState::Error);
    assert_eq!(status.consecutive_failures, 10);
    assert_eq!(status.error_since, Some(at(200)));
    assert!(h.supervisor.actions().is_empty());
}

#[tokio::test]
async fn test_failed_restart_stays_in_error() {
    let h = harness(vec![local_service("broken")]);
    h.caller.respond("broken", "health", MockReply::unhealthy());
    h.supervisor.fail_spawns("broken");

    for secs in 0..3 {
        h.monitor.poll_once_at(at(secs)).await;
    }

    let status = h.monitor.status("broken").unwrap();
    assert_state(&status, ServiceState::Error);
    assert_eq!(status.restart_attempts, 1);
    assert!(status
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("scripted spawn failure"));
    assert_eq!(h.monitor.metrics().failed_restarts, 1);
}

#[tokio::test]
async fn test_restart_limit_stops_restarting() {
    let policy = RestartPolicy {
        max_consecutive_failures: 1,
        cooldown: Duration::from_secs(1),
        max_restart_attempts: Some(2),
    };
    let h = harness(vec![local_service("worker").with_restart_policy(policy)]);
    h.caller
        .respond("worker", "health", MockReply::timeout("worker", "health"));
    let mut events = h.monitor.subscribe();

    for secs in (0..6).map(|i| i * 10) {
        h.monitor.poll_once_at(at(secs)).await;
    }

    assert_eq!(h.supervisor.restarts_of("worker"), 2);
    let status = h.monitor.status("worker").unwrap();
    assert_state(&status, ServiceState::Error);
    assert_eq!(h.monitor.metrics().skipped_restarts, 4);

    let mut limit_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, HealthEvent::RestartLimitReached { attempts: 2, .. }) {
            limit_events += 1;
        }
    }
    assert_eq!(limit_events, 1);
}

#[tokio::test]
async fn test_state_changes_are_broadcast() {
    let h = harness(vec![local_service("a")]);
    let mut events = h.monitor.subscribe();
    h.caller.script_health("a", &[true, false, false]);

    h.monitor.poll_once_at(at(0)).await;
    h.monitor.poll_once_at(at(1)).await;
    h.monitor.poll_once_at(at(2)).await;

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let HealthEvent::StateChanged { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    // The second failure leaves the state unchanged and emits nothing.
    assert_eq!(
        transitions,
        vec![
            (ServiceState::Unknown, ServiceState::Active),
            (ServiceState::Active, ServiceState::Unhealthy),
        ]
    );
}

#[tokio::test]
async fn test_start_failure_marks_error() {
    let h = harness(vec![local_service("a")]);
    h.monitor.note_start_failed("a", "binary missing");

    let status = h.monitor.status("a").unwrap();
    assert_state(&status, ServiceState::Error);
    assert_eq!(status.last_error.as_deref(), Some("binary missing"));
    assert!(status.error_since.is_some());

    h.monitor.note_started("a");
    assert_state(&h.monitor.status("a").unwrap(), ServiceState::Starting);
}

#[tokio::test]
async fn test_spawned_loops_poll_until_shutdown() {
    let h = harness(vec![local_service("a"), remote_service("b")]);
    let (tx, rx) = watch::channel(false);

    let handles = h.monitor.spawn(rx);
    assert_eq!(handles.len(), 2);

    tokio::time::sleep(Duration::from_millis(180)).await;
    tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("health loop did not stop")
            .unwrap();
    }

    assert!(h.caller.call_count("a", "health") >= 2);
    assert!(h.caller.call_count("b", "health") >= 2);
    assert_state(&h.monitor.status("a").unwrap(), ServiceState::Active);

    // No more checks after shutdown.
    let before = h.caller.call_count("a", "health");
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.caller.call_count("a", "health"), before);
}

#[tokio::test]
async fn test_supervisor_restart_action_recorded() {
    let policy = RestartPolicy {
        max_consecutive_failures: 1,
        ..RestartPolicy::default()
    };
    let h = harness(vec![local_service("a").with_restart_policy(policy)]);
    h.caller.script_health("a", &[false]);

    h.monitor.poll_once_at(at(0)).await;

    assert_eq!(
        h.supervisor.actions(),
        vec![SupervisorAction::Restart("a".to_string())]
    );
}

#[tokio::test]
async fn test_hanging_services_do_not_delay_the_others() {
    let timeout = Duration::from_millis(300);
    let h = harness_with(
        vec![
            remote_service("stuck-1"),
            remote_service("stuck-2"),
            remote_service("stuck-3"),
            remote_service("a"),
            remote_service("b"),
        ],
        HealthConfig {
            interval: Duration::from_secs(5),
            timeout,
        },
    );
    for stuck in ["stuck-1", "stuck-2", "stuck-3"] {
        h.caller.respond(
            stuck,
            "health",
            MockReply::healthy().delayed(Duration::from_secs(30)),
        );
    }

    let started = std::time::Instant::now();
    h.monitor.poll_once().await;
    let elapsed = started.elapsed();

    // One timeout for the whole pass, not one per hanging service.
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout * 2, "pass took {:?}", elapsed);

    assert_state(&h.monitor.status("a").unwrap(), ServiceState::Active);
    assert_state(&h.monitor.status("b").unwrap(), ServiceState::Active);
    for stuck in ["stuck-1", "stuck-2", "stuck-3"] {
        let status = h.monitor.status(stuck).unwrap();
        assert_state(&status, ServiceState::Unhealthy);
        assert_eq!(status.consecutive_failures, 1);
    }
}

#[tokio::test]
async fn test_check_is_stamped_when_the_reply_arrives() {
    let h = harness_with(
        vec![remote_service("slow"), remote_service("stuck")],
        HealthConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_millis(300),
        },
    );
    h.caller.respond(
        "slow",
        "health",
        MockReply::healthy().delayed(Duration::from_millis(150)),
    );
    h.caller.respond(
        "stuck",
        "health",
        MockReply::healthy().delayed(Duration::from_secs(30)),
    );
    let slow = remote_service("slow");
    let stuck = remote_service("stuck");

    let before = Utc::now();
    h.monitor.check_service(&slow).await;
    let last_check = h.monitor.status("slow").unwrap().last_check.unwrap();
    assert!(last_check >= before + ChronoDuration::milliseconds(150));

    let before = Utc::now();
    h.monitor.check_service(&stuck).await;
    let last_check = h.monitor.status("stuck").unwrap().last_check.unwrap();
    assert!(last_check >= before + ChronoDuration::milliseconds(300));
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

/// Expected outcome of a run of checks one second apart, threshold 3,
/// cooldown 60 s. With fewer than 60 checks at most one restart can happen.
fn model(outcomes: &[bool]) -> (ServiceState, u32, usize) {
    let mut state = ServiceState::Unknown;
    let mut failures = 0u32;
    let mut restarts = 0usize;
    for &ok in outcomes {
        if ok {
            state = ServiceState::Active;
            failures = 0;
        } else {
            failures += 1;
            if failures < 3 {
                state = ServiceState::Unhealthy;
            } else if restarts == 0 {
                restarts = 1;
                failures = 0;
                state = ServiceState::Starting;
            } else {
                state = ServiceState::Error;
            }
        }
    }
    (state, failures, restarts)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// The monitor follows the threshold/cooldown state machine exactly.
    #[test]
    fn prop_monitor_matches_state_machine(outcomes in arb_health_outcomes(50)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = harness(vec![local_service("svc")]);
            h.caller.script_health("svc", &outcomes);

            for i in 0..outcomes.len() {
                h.monitor.poll_once_at(at(i as i64)).await;
            }

            let (state, failures, restarts) = model(&outcomes);
            let status = h.monitor.status("svc").unwrap();
            prop_assert_eq!(status.state, state);
            prop_assert_eq!(status.consecutive_failures, failures);
            prop_assert_eq!(h.supervisor.restarts_of("svc"), restarts);
            prop_assert!(restarts <= 1);
            Ok(())
        })?;
    }

    /// A passing check always lands in `active` with the counter cleared.
    #[test]
    fn prop_success_resets_failures(outcomes in arb_health_outcomes(20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = harness(vec![remote_service("svc")]);
            h.caller.script_health("svc", &outcomes);
            h.caller.push_reply("svc", "health", MockReply::healthy());

            for i in 0..=outcomes.len() {
                h.monitor.poll_once_at(at(i as i64)).await;
            }

            let status = h.monitor.status("svc").unwrap();
            prop_assert_eq!(status.state, ServiceState::Active);
            prop_assert_eq!(status.consecutive_failures, 0);
            prop_assert!(h.supervisor.actions().is_empty());
            Ok(())
        })?;
    }
}
