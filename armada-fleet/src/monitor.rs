//! Health monitor
//!
//! One task per registered service calls `health` on a fixed interval and
//! updates that service's status. The check outcome drives the lifecycle:
//!
//! - `healthy`/`degraded`: `active`, counters reset
//! - timeout, transport error, malformed payload or `unhealthy`: one more
//!   consecutive failure; `unhealthy` below the policy threshold, `error` at
//!   or above it
//! - `error` on a locally hosted service whose cooldown has elapsed: restart
//!   through the supervisor, then `starting` (or `error` if the spawn failed)
//!
//! Externally hosted services are never restarted.

use crate::registry::ServiceRegistry;
use crate::status::StatusBoard;
use armada_core::constants::HEALTH_EVENT_CAPACITY;
use armada_core::{
    HealthConfig, HealthReport, ProcessControl, ServiceCaller, ServiceDescriptor, ServiceState,
    ServiceStatus, SupervisionError, Timestamp, METHOD_HEALTH,
};
use chrono::Utc;
use dashmap::DashSet;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

// ============================================================================
// EVENTS
// ============================================================================

/// Notable monitor activity, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealthEvent {
    StateChanged {
        service: String,
        from: ServiceState,
        to: ServiceState,
        at: Timestamp,
    },
    RestartAttempted {
        service: String,
        attempt: u32,
        succeeded: bool,
        at: Timestamp,
    },
    RestartLimitReached {
        service: String,
        attempts: u32,
        at: Timestamp,
    },
}

impl HealthEvent {
    pub fn service(&self) -> &str {
        match self {
            HealthEvent::StateChanged { service, .. }
            | HealthEvent::RestartAttempted { service, .. }
            | HealthEvent::RestartLimitReached { service, .. } => service,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for monitor activity since startup.
#[derive(Debug, Default)]
pub struct HealthMetrics {
    pub checks: AtomicU64,
    pub failed_checks: AtomicU64,
    pub restarts: AtomicU64,
    pub failed_restarts: AtomicU64,
    pub skipped_restarts: AtomicU64,
}

impl HealthMetrics {
    pub fn snapshot(&self) -> HealthMetricsSnapshot {
        HealthMetricsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            failed_checks: self.failed_checks.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            failed_restarts: self.failed_restarts.load(Ordering::Relaxed),
            skipped_restarts: self.skipped_restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthMetricsSnapshot {
    pub checks: u64,
    pub failed_checks: u64,
    pub restarts: u64,
    pub failed_restarts: u64,
    pub skipped_restarts: u64,
}

// ============================================================================
// MONITOR
// ============================================================================

enum NextStep {
    Nothing,
    Restart,
}

pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    caller: Arc<dyn ServiceCaller>,
    supervisor: Arc<dyn ProcessControl>,
    config: HealthConfig,
    board: Arc<StatusBoard>,
    events: broadcast::Sender<HealthEvent>,
    metrics: HealthMetrics,
    /// Services whose restart limit has been reported since their last
    /// healthy check.
    limit_reported: DashSet<String>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        caller: Arc<dyn ServiceCaller>,
        supervisor: Arc<dyn ProcessControl>,
        config: HealthConfig,
    ) -> Self {
        let board = Arc::new(StatusBoard::new(registry.names()));
        let (events, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);
        Self {
            registry,
            caller,
            supervisor,
            config,
            board,
            events,
            metrics: HealthMetrics::default(),
            limit_reported: DashSet::new(),
        }
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.board)
    }

    pub fn status(&self, service: &str) -> Option<ServiceStatus> {
        self.board.get(service)
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.board.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> HealthMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record that the orchestrator launched `service`.
    pub fn note_started(&self, service: &str) {
        self.set_state(service, ServiceState::Starting, Utc::now());
    }

    /// Record that the orchestrator failed to launch `service`.
    pub fn note_start_failed(&self, service: &str, reason: &str) {
        let now = Utc::now();
        self.board.update(service, |status| {
            status.last_error = Some(reason.to_string());
            status.error_since.get_or_insert(now);
        });
        self.set_state(service, ServiceState::Error, now);
    }

    /// Check every service once, concurrently, and return the statuses.
    pub async fn poll_once(&self) -> Vec<ServiceStatus> {
        let checks = self
            .registry
            .all()
            .iter()
            .map(|descriptor| self.check_service(descriptor));
        futures_util::future::join_all(checks).await;
        self.board.snapshot()
    }

    /// `poll_once` with an explicit clock reading.
    pub async fn poll_once_at(&self, now: Timestamp) -> Vec<ServiceStatus> {
        let checks = self
            .registry
            .all()
            .iter()
            .map(|descriptor| self.check_service_at(descriptor, now));
        futures_util::future::join_all(checks).await;
        self.board.snapshot()
    }

    /// Check one service and apply the restart policy. The check is stamped
    /// with the time the `health` call returned.
    pub async fn check_service(&self, descriptor: &ServiceDescriptor) -> Option<ServiceStatus> {
        let probe = self.probe(descriptor).await;
        self.apply_probe(descriptor, probe, Utc::now()).await
    }

    pub async fn check_service_at(
        &self,
        descriptor: &ServiceDescriptor,
        now: Timestamp,
    ) -> Option<ServiceStatus> {
        let probe = self.probe(descriptor).await;
        self.apply_probe(descriptor, probe, now).await
    }

    async fn apply_probe(
        &self,
        descriptor: &ServiceDescriptor,
        probe: Result<(), String>,
        now: Timestamp,
    ) -> Option<ServiceStatus> {
        let name = descriptor.name.as_str();
        self.metrics.checks.fetch_add(1, Ordering::Relaxed);

        let policy = &descriptor.restart_policy;
        let (previous, next) = self.board.update(name, |status| {
            let previous = status.state;
            status.last_check = Some(now);

            let next = match &probe {
                Ok(()) => {
                    status.state = ServiceState::Active;
                    status.consecutive_failures = 0;
                    status.restart_attempts = 0;
                    status.error_since = None;
                    status.last_error = None;
                    NextStep::Nothing
                }
                Err(reason) => {
                    status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                    status.last_error = Some(reason.clone());
                    if status.consecutive_failures < policy.max_consecutive_failures {
                        status.state = ServiceState::Unhealthy;
                        NextStep::Nothing
                    } else {
                        status.state = ServiceState::Error;
                        status.error_since.get_or_insert(now);
                        self.restart_decision(descriptor, status, now)
                    }
                }
            };
            (previous, next)
        })?;

        if probe.is_ok() {
            self.limit_reported.remove(name);
        } else {
            self.metrics.failed_checks.fetch_add(1, Ordering::Relaxed);
        }
        self.emit_transition(name, previous, self.board.state(name)?, now);

        if let NextStep::Restart = next {
            self.restart(descriptor, now).await;
        }

        self.board.get(name)
    }

    /// Spawn one polling task per service. Each task exits when `shutdown`
    /// flips to `true` or its sender is dropped.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.registry
            .all()
            .iter()
            .cloned()
            .map(|descriptor| {
                let monitor = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let period = monitor.config.interval;
                    let mut ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                    debug!(service = %descriptor.name, interval_ms = period.as_millis() as u64, "Health loop started");
                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                            _ = ticker.tick() => {
                                monitor.check_service(&descriptor).await;
                            }
                        }
                    }
                    debug!(service = %descriptor.name, "Health loop stopped");
                })
            })
            .collect()
    }

    async fn probe(&self, descriptor: &ServiceDescriptor) -> Result<(), String> {
        let value = self
            .caller
            .call(
                descriptor,
                METHOD_HEALTH,
                serde_json::json!({}),
                self.config.timeout,
            )
            .await
            .map_err(|e| e.to_string())?;

        let report = HealthReport::from_value(&descriptor.name, value).map_err(|e| e.to_string())?;
        if report.status.is_serving() {
            Ok(())
        } else {
            Err(format!("service reported {:?}", report.status).to_lowercase())
        }
    }

    /// Decide whether a service that just landed in `error` gets restarted.
    /// Runs under the board lock, so it must not block.
    fn restart_decision(
        &self,
        descriptor: &ServiceDescriptor,
        status: &ServiceStatus,
        now: Timestamp,
    ) -> NextStep {
        let name = descriptor.name.as_str();
        let policy = &descriptor.restart_policy;

        if !descriptor.is_local() {
            debug!(service = %name, "Externally hosted service in error; not restarting");
            return NextStep::Nothing;
        }

        let cooled_down = match status.last_restart {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed > policy.cooldown)
                .unwrap_or(false),
        };
        if !cooled_down {
            debug!(service = %name, "Restart cooldown active");
            return NextStep::Nothing;
        }

        if let Some(max) = policy.max_restart_attempts {
            if status.restart_attempts >= max {
                self.metrics.skipped_restarts.fetch_add(1, Ordering::Relaxed);
                if self.limit_reported.insert(name.to_string()) {
                    let err = SupervisionError::RestartLimitExceeded {
                        service: name.to_string(),
                        attempts: status.restart_attempts,
                    };
                    error!(service = %name, error = %err, "Giving up on restarts");
                    let _ = self.events.send(HealthEvent::RestartLimitReached {
                        service: name.to_string(),
                        attempts: status.restart_attempts,
                        at: now,
                    });
                }
                return NextStep::Nothing;
            }
        }

        NextStep::Restart
    }

    async fn restart(&self, descriptor: &ServiceDescriptor, now: Timestamp) {
        let name = descriptor.name.as_str();
        warn!(service = %name, "Restarting service after sustained failures");

        let result = self.supervisor.restart(descriptor).await;
        let succeeded = result.is_ok();
        if let Err(e) = &result {
            error!(service = %name, error = %e, "Restart failed");
            self.metrics.failed_restarts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.restarts.fetch_add(1, Ordering::Relaxed);
        }

        let Some((previous, attempt)) = self.board.update(name, |status| {
            let previous = status.state;
            status.last_restart = Some(now);
            status.consecutive_failures = 0;
            status.restart_attempts = status.restart_attempts.saturating_add(1);
            match &result {
                Ok(_) => status.state = ServiceState::Starting,
                Err(e) => {
                    status.state = ServiceState::Error;
                    status.last_error = Some(e.to_string());
                }
            }
            (previous, status.restart_attempts)
        }) else {
            return;
        };

        let _ = self.events.send(HealthEvent::RestartAttempted {
            service: name.to_string(),
            attempt,
            succeeded,
            at: now,
        });
        if let Some(current) = self.board.state(name) {
            self.emit_transition(name, previous, current, now);
        }
        if succeeded {
            info!(service = %name, attempt, "Service restarted");
        }
    }

    fn set_state(&self, service: &str, state: ServiceState, now: Timestamp) {
        if let Some(previous) = self.board.update(service, |status| {
            let previous = status.state;
            status.state = state;
            previous
        }) {
            self.emit_transition(service, previous, state, now);
        }
    }

    fn emit_transition(&self, service: &str, from: ServiceState, to: ServiceState, at: Timestamp) {
        if from == to {
            return;
        }
        match to {
            ServiceState::Error => warn!(service = %service, from = %from, "Service entered error"),
            ServiceState::Active => info!(service = %service, from = %from, "Service active"),
            _ => debug!(service = %service, from = %from, to = %to, "Service state changed"),
        }
        let _ = self.events.send(HealthEvent::StateChanged {
            service: service.to_string(),
            from,
            to,
            at,
        });
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("services", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}
