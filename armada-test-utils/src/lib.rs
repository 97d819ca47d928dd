//! ARMADA Test Utilities
//!
//! Centralized test infrastructure for the ARMADA workspace:
//! - Scripted mocks for the `ServiceCaller` and `ProcessControl` seams
//! - Proptest generators for descriptors, health payloads and knowledge
//! - Test fixtures for common service layouts
//! - Custom assertions for ARMADA-specific validation

pub use armada_core::{
    HealthStatus, KnowledgeEntity, KnowledgeRelation, ProcessControl, ProcessError, ProcessHandle,
    ProtocolError, RestartPolicy, RpcError, RpcResult, ServiceCaller, ServiceDescriptor,
    ServiceState, ServiceStatus, Timestamp, Transport, TransportError, METHOD_HEALTH,
    METHOD_INITIALIZE,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// MOCK CALLER
// ============================================================================

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Value(Value),
    Error(RpcError),
    /// Wait before producing the inner reply.
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn healthy() -> Self {
        MockReply::Value(json!({ "status": "healthy", "timestamp": Utc::now() }))
    }

    pub fn degraded() -> Self {
        MockReply::Value(json!({ "status": "degraded", "timestamp": Utc::now() }))
    }

    pub fn unhealthy() -> Self {
        MockReply::Value(json!({ "status": "unhealthy", "timestamp": Utc::now() }))
    }

    /// A timeout, the way an unreachable service looks to the monitor.
    pub fn timeout(service: &str, method: &str) -> Self {
        MockReply::Error(
            TransportError::Timeout {
                service: service.to_string(),
                method: method.to_string(),
                timeout: Duration::from_secs(5),
            }
            .into(),
        )
    }

    pub fn delayed(self, by: Duration) -> Self {
        MockReply::Delayed(by, Box::new(self))
    }
}

/// A call observed by [`MockCaller`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub service: String,
    pub method: String,
    pub params: Value,
}

type CallKey = (String, String);

/// Scripted `ServiceCaller`.
///
/// Replies are looked up per `(service, method)`: queued one-shot replies
/// first, then the sticky default. Unscripted calls answer `initialize`
/// with `{}`, `health` with a healthy report and anything else with
/// `NotImplemented`.
#[derive(Debug, Default)]
pub struct MockCaller {
    queued: Mutex<HashMap<CallKey, VecDeque<MockReply>>>,
    defaults: Mutex<HashMap<CallKey, MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockCaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sticky reply for `(service, method)`.
    pub fn respond(&self, service: &str, method: &str, reply: MockReply) {
        if let Ok(mut defaults) = self.defaults.lock() {
            defaults.insert((service.to_string(), method.to_string()), reply);
        }
    }

    /// Queue a one-shot reply for `(service, method)`.
    pub fn push_reply(&self, service: &str, method: &str, reply: MockReply) {
        if let Ok(mut queued) = self.queued.lock() {
            queued
                .entry((service.to_string(), method.to_string()))
                .or_default()
                .push_back(reply);
        }
    }

    /// Queue a sequence of health outcomes: `true` healthy, `false` timeout.
    pub fn script_health(&self, service: &str, outcomes: &[bool]) {
        for &ok in outcomes {
            let reply = if ok {
                MockReply::healthy()
            } else {
                MockReply::timeout(service, METHOD_HEALTH)
            };
            self.push_reply(service, METHOD_HEALTH, reply);
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, service: &str, method: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.service == service && c.method == method)
            .count()
    }

    fn next_reply(&self, service: &str, method: &str) -> Option<MockReply> {
        let key = (service.to_string(), method.to_string());
        if let Ok(mut queued) = self.queued.lock() {
            if let Some(reply) = queued.get_mut(&key).and_then(VecDeque::pop_front) {
                return Some(reply);
            }
        }
        self.defaults
            .lock()
            .ok()
            .and_then(|defaults| defaults.get(&key).cloned())
    }
}

#[async_trait]
impl ServiceCaller for MockCaller {
    async fn call(
        &self,
        descriptor: &ServiceDescriptor,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> RpcResult<Value> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                service: descriptor.name.clone(),
                method: method.to_string(),
                params,
            });
        }

        let mut reply = match self.next_reply(&descriptor.name, method) {
            Some(reply) => reply,
            None => match method {
                METHOD_INITIALIZE => MockReply::Value(json!({})),
                METHOD_HEALTH => MockReply::healthy(),
                _ => MockReply::Error(
                    ProtocolError::NotImplemented {
                        service: descriptor.name.clone(),
                        method: method.to_string(),
                    }
                    .into(),
                ),
            },
        };

        // Delayed replies past the deadline time out, as on a real transport.
        let answer = async move {
            loop {
                match reply {
                    MockReply::Value(value) => return Ok(value),
                    MockReply::Error(err) => return Err(err),
                    MockReply::Delayed(by, inner) => {
                        tokio::time::sleep(by).await;
                        reply = *inner;
                    }
                }
            }
        };
        tokio::time::timeout(timeout, answer).await.unwrap_or_else(|_| {
            Err(TransportError::Timeout {
                service: descriptor.name.clone(),
                method: method.to_string(),
                timeout,
            }
            .into())
        })
    }
}

// ============================================================================
// RECORDING SUPERVISOR
// ============================================================================

/// Lifecycle action observed by [`RecordingSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    Start(String),
    Stop(String),
    Restart(String),
}

/// `ProcessControl` that records actions instead of spawning processes.
#[derive(Debug, Default)]
pub struct RecordingSupervisor {
    actions: Mutex<Vec<SupervisorAction>>,
    running: Mutex<BTreeSet<String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl RecordingSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every start and restart of `service` fail with `SpawnFailed`.
    pub fn fail_spawns(&self, service: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(service.to_string());
        }
    }

    pub fn actions(&self) -> Vec<SupervisorAction> {
        self.actions.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn restarts_of(&self, service: &str) -> usize {
        self.actions()
            .iter()
            .filter(|a| matches!(a, SupervisorAction::Restart(name) if name == service))
            .count()
    }

    fn record(&self, action: SupervisorAction) {
        if let Ok(mut actions) = self.actions.lock() {
            actions.push(action);
        }
    }

    fn launch(&self, descriptor: &ServiceDescriptor) -> Result<ProcessHandle, ProcessError> {
        let fails = self
            .failing
            .lock()
            .map(|f| f.contains(&descriptor.name))
            .unwrap_or(false);
        if fails {
            return Err(ProcessError::SpawnFailed {
                service: descriptor.name.clone(),
                command: descriptor
                    .launch
                    .as_ref()
                    .map(|l| l.command.clone())
                    .unwrap_or_default(),
                reason: "scripted spawn failure".to_string(),
            });
        }
        if let Ok(mut running) = self.running.lock() {
            running.insert(descriptor.name.clone());
        }
        Ok(ProcessHandle {
            service: descriptor.name.clone(),
            pid: None,
            started_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ProcessControl for RecordingSupervisor {
    async fn start(&self, descriptor: &ServiceDescriptor) -> Result<ProcessHandle, ProcessError> {
        self.record(SupervisorAction::Start(descriptor.name.clone()));
        self.launch(descriptor)
    }

    async fn stop(&self, descriptor: &ServiceDescriptor, _grace: Duration) -> Result<(), ProcessError> {
        self.record(SupervisorAction::Stop(descriptor.name.clone()));
        if let Ok(mut running) = self.running.lock() {
            running.remove(&descriptor.name);
        }
        Ok(())
    }

    async fn restart(&self, descriptor: &ServiceDescriptor) -> Result<ProcessHandle, ProcessError> {
        self.record(SupervisorAction::Restart(descriptor.name.clone()));
        self.launch(descriptor)
    }

    async fn stop_all(&self, _grace: Duration) -> Vec<(String, Result<(), ProcessError>)> {
        let names: Vec<String> = self
            .running
            .lock()
            .map(|mut running| std::mem::take(&mut *running).into_iter().collect())
            .unwrap_or_default();
        names
            .into_iter()
            .map(|name| {
                self.record(SupervisorAction::Stop(name.clone()));
                (name, Ok(()))
            })
            .collect()
    }

    async fn running(&self) -> Vec<String> {
        self.running
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for ARMADA types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_service_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{2,15}"
    }

    pub fn arb_health_status() -> impl Strategy<Value = HealthStatus> {
        prop_oneof![
            Just(HealthStatus::Healthy),
            Just(HealthStatus::Degraded),
            Just(HealthStatus::Unhealthy),
            Just(HealthStatus::Unknown),
        ]
    }

    /// A run of health check outcomes: `true` for a passing check.
    pub fn arb_health_outcomes(max_len: usize) -> impl Strategy<Value = Vec<bool>> {
        prop::collection::vec(any::<bool>(), 0..max_len)
    }

    pub fn arb_restart_policy() -> impl Strategy<Value = RestartPolicy> {
        (1u32..6, 1u64..300, prop::option::of(1u32..5)).prop_map(
            |(threshold, cooldown_secs, max_attempts)| RestartPolicy {
                max_consecutive_failures: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
                max_restart_attempts: max_attempts,
            },
        )
    }

    pub fn arb_entity() -> impl Strategy<Value = KnowledgeEntity> {
        (
            "[a-z]{1,8}:[0-9]{1,4}",
            "[a-z_]{3,16}",
            prop::collection::vec("[A-Za-z0-9 ]{0,40}", 0..4),
        )
            .prop_map(|(id, entity_type, observations)| {
                KnowledgeEntity::new(id, entity_type).with_observations(observations)
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built descriptors for common testing scenarios.

    use super::*;
    use armada_core::LaunchSpec;

    /// Locally hosted service with the default restart policy.
    pub fn local_service(name: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(
            name,
            format!("ws://127.0.0.1:0/{}", name),
            Transport::PersistentChannel,
        )
        .with_launch(LaunchSpec::new("true"))
    }

    /// Externally hosted service; never restarted by the monitor.
    pub fn remote_service(name: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(
            name,
            format!("http://127.0.0.1:0/{}", name),
            Transport::RequestResponse,
        )
    }

    pub fn in_process_service(name: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(name, "in-process", Transport::InProcess)
    }

    /// Threshold 3, cooldown 60 s, unbounded attempts.
    pub fn default_policy() -> RestartPolicy {
        RestartPolicy::default()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for ARMADA-specific validation.

    use super::*;

    #[track_caller]
    pub fn assert_state(status: &ServiceStatus, expected: ServiceState) {
        assert_eq!(
            status.state, expected,
            "service {} expected {:?}, got {}",
            status.name, expected, status.summary()
        );
    }

    #[track_caller]
    pub fn assert_not_implemented<T: std::fmt::Debug>(result: &RpcResult<T>) {
        match result {
            Err(err) if err.is_not_implemented() => {}
            other => panic!("Expected NotImplemented, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_transport_error<T: std::fmt::Debug>(result: &RpcResult<T>) {
        match result {
            Err(RpcError::Transport(_)) => {}
            other => panic!("Expected transport error, got: {:?}", other),
        }
    }
}
