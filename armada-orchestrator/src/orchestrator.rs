//! Ecosystem state machine
//!
//! The orchestrator owns no service logic itself. It wires the subsystems
//! together, runs startup and shutdown in order, and derives the single
//! ecosystem state from service health and cycle activity:
//!
//! ```text
//! initializing -> active            startup complete
//! active <-> learning | optimizing  tagged cycles running (not while in error)
//! active -> error                   required service in error past the grace period
//! error -> active                   failing required services check healthy again
//! * -> shutdown                     terminal
//! ```

use crate::manifest::ResolvedManifest;
use armada_core::{
    new_record_suffix, ArmadaResult, CycleKind, EcosystemState, KnowledgeEntity,
    OrchestratorConfig, ProcessControl, ServiceCaller, ServiceState, ServiceStatus, Timestamp,
    ENTITY_ECOSYSTEM_SNAPSHOT, METHOD_INITIALIZE,
};
use armada_fleet::{HealthEvent, HealthMonitor, ProcessSupervisor, ServiceRegistry};
use armada_knowledge::KnowledgeStore;
use armada_workflow::{CycleEvent, WorkflowScheduler};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Subsystems handed to [`Orchestrator::new`].
pub struct Components {
    pub registry: Arc<ServiceRegistry>,
    pub caller: Arc<dyn ServiceCaller>,
    pub supervisor: Arc<dyn ProcessControl>,
    pub monitor: Arc<HealthMonitor>,
    pub store: Arc<KnowledgeStore>,
    pub scheduler: Arc<WorkflowScheduler>,
}

impl Components {
    /// Build the production subsystems for a resolved manifest.
    pub fn assemble(manifest: ResolvedManifest, caller: Arc<dyn ServiceCaller>) -> ArmadaResult<Self> {
        let ResolvedManifest {
            config,
            registry,
            cycles,
        } = manifest;

        let registry = Arc::new(registry);
        let store = Arc::new(KnowledgeStore::open(&config.store)?);
        let supervisor: Arc<dyn ProcessControl> =
            Arc::new(ProcessSupervisor::new(config.stop_grace));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&caller),
            Arc::clone(&supervisor),
            config.health.clone(),
        ));
        let scheduler = Arc::new(WorkflowScheduler::new(
            cycles,
            Arc::clone(&registry),
            Arc::clone(&caller),
            Arc::clone(&store),
        ));

        Ok(Self {
            registry,
            caller,
            supervisor,
            monitor,
            store,
            scheduler,
        })
    }
}

/// What shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Id of the `ecosystem_snapshot` entity, if it was written
    pub snapshot_id: Option<String>,
    /// Services whose process could not be stopped cleanly
    pub stop_failures: Vec<(String, String)>,
}

/// Tagged cycles currently in flight.
#[derive(Debug, Default)]
struct CycleActivity {
    learning: usize,
    optimizing: usize,
}

impl CycleActivity {
    fn derived_state(&self) -> EcosystemState {
        if self.learning > 0 {
            EcosystemState::Learning
        } else if self.optimizing > 0 {
            EcosystemState::Optimizing
        } else {
            EcosystemState::Active
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<ServiceRegistry>,
    caller: Arc<dyn ServiceCaller>,
    supervisor: Arc<dyn ProcessControl>,
    monitor: Arc<HealthMonitor>,
    store: Arc<KnowledgeStore>,
    scheduler: Arc<WorkflowScheduler>,
    state: watch::Sender<EcosystemState>,
    shutdown_signal: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    activity: Mutex<CycleActivity>,
    /// Required services that put the ecosystem into `error`.
    tripped_by: Mutex<BTreeSet<String>>,
    started_at: Instant,
    shut_down: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, components: Components) -> ArmadaResult<Self> {
        config.validate()?;
        let (state, _) = watch::channel(EcosystemState::Initializing);
        let (shutdown_signal, _) = watch::channel(false);

        Ok(Self {
            config,
            registry: components.registry,
            caller: components.caller,
            supervisor: components.supervisor,
            monitor: components.monitor,
            store: components.store,
            scheduler: components.scheduler,
            state,
            shutdown_signal,
            tasks: Mutex::new(Vec::new()),
            activity: Mutex::new(CycleActivity::default()),
            tripped_by: Mutex::new(BTreeSet::new()),
            started_at: Instant::now(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Production wiring: LMDB or in-memory store, real process supervisor.
    pub fn assemble(manifest: ResolvedManifest, caller: Arc<dyn ServiceCaller>) -> ArmadaResult<Self> {
        let config = manifest.config.clone();
        let components = Components::assemble(manifest, caller)?;
        Self::new(config, components)
    }

    pub fn state(&self) -> EcosystemState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EcosystemState> {
        self.state.subscribe()
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.monitor.statuses()
    }

    pub fn scheduler(&self) -> &Arc<WorkflowScheduler> {
        &self.scheduler
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Bring the ecosystem up: launch local services, handshake, run one
    /// full health pass, then start the background loops and enter `active`.
    pub async fn start(self: &Arc<Self>) -> ArmadaResult<()> {
        info!(services = self.registry.len(), "Starting ecosystem");

        for descriptor in self.registry.local() {
            match self.supervisor.start(descriptor).await {
                Ok(handle) => {
                    debug!(service = %descriptor.name, pid = ?handle.pid, "Service launched");
                    self.monitor.note_started(&descriptor.name);
                }
                Err(e) => {
                    error!(service = %descriptor.name, error = %e, "Failed to launch service");
                    self.monitor.note_start_failed(&descriptor.name, &e.to_string());
                }
            }
        }

        self.handshake().await;
        self.monitor.poll_once().await;

        let shutdown = self.shutdown_signal.subscribe();
        let mut handles = self.monitor.spawn(shutdown.clone());
        handles.extend(self.scheduler.spawn(shutdown.clone()));
        handles.push(self.spawn_evaluation_loop(shutdown));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }

        self.transition(EcosystemState::Active);
        self.evaluate_at(Utc::now());
        Ok(())
    }

    /// Call `initialize` on every service that is not already known to be
    /// down. Failures are logged and left to the health monitor.
    async fn handshake(&self) {
        let Some(timeout) = self.config.handshake_timeout else {
            debug!("Startup handshake disabled");
            return;
        };

        let params = serde_json::json!({
            "orchestrator": "armada",
            "version": env!("CARGO_PKG_VERSION"),
        });
        let calls = self
            .registry
            .all()
            .iter()
            .filter(|d| self.monitor.status(&d.name).map(|s| s.state) != Some(ServiceState::Error))
            .map(|descriptor| {
                let params = params.clone();
                async move {
                    let result = self
                        .caller
                        .call(descriptor, METHOD_INITIALIZE, params, timeout)
                        .await;
                    (descriptor.name.as_str(), result)
                }
            });

        for (service, result) in futures_util::future::join_all(calls).await {
            match result {
                Ok(_) => debug!(service = %service, "Handshake complete"),
                Err(e) => warn!(service = %service, error = %e, "Handshake failed"),
            }
        }
    }

    fn spawn_evaluation_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut cycle_events = self.scheduler.subscribe();
        let mut health_events = self.monitor.subscribe();

        tokio::spawn(async move {
            let period = orchestrator.config.evaluation_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        orchestrator.evaluate_at(Utc::now());
                    }
                    event = cycle_events.recv() => match event {
                        Ok(event) => orchestrator.on_cycle_event(&event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Cycle events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = health_events.recv() => match event {
                        Ok(HealthEvent::StateChanged { .. }) => {
                            orchestrator.evaluate_at(Utc::now());
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Health events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Evaluation loop stopped");
        })
    }

    /// Re-derive the ecosystem state from required-service health at `now`.
    pub fn evaluate_at(&self, now: Timestamp) -> EcosystemState {
        let current = self.state();
        if matches!(current, EcosystemState::Initializing | EcosystemState::Shutdown) {
            return current;
        }

        let grace = self.config.error_grace_period;
        let mut in_error = BTreeSet::new();
        let mut past_grace = BTreeSet::new();
        for descriptor in self.registry.required() {
            let Some(status) = self.monitor.status(&descriptor.name) else {
                continue;
            };
            if status.state != ServiceState::Error {
                continue;
            }
            in_error.insert(descriptor.name.clone());
            let expired = status
                .error_since
                .map(|since| {
                    (now - since)
                        .to_std()
                        .map(|elapsed| elapsed >= grace)
                        .unwrap_or(grace.is_zero())
                })
                .unwrap_or(false);
            if expired {
                past_grace.insert(descriptor.name.clone());
            }
        }

        if current == EcosystemState::Error {
            let recovered = self
                .tripped_by
                .lock()
                .map(|tripped| {
                    tripped.iter().all(|name| {
                        self.monitor.status(name).map(|s| s.state) == Some(ServiceState::Active)
                    })
                })
                .unwrap_or(false);
            if recovered && past_grace.is_empty() {
                if let Ok(mut tripped) = self.tripped_by.lock() {
                    tripped.clear();
                }
                info!("Required services recovered");
                let next = self.derived_state();
                self.transition(next);
            } else if let Ok(mut tripped) = self.tripped_by.lock() {
                tripped.extend(past_grace);
            }
        } else if !past_grace.is_empty() {
            error!(
                services = ?past_grace,
                grace_secs = grace.as_secs(),
                "Required services in error past grace period"
            );
            if let Ok(mut tripped) = self.tripped_by.lock() {
                *tripped = past_grace;
            }
            self.transition(EcosystemState::Error);
        } else if !in_error.is_empty() {
            debug!(services = ?in_error, "Required services in error within grace period");
        }

        self.state()
    }

    fn on_cycle_event(&self, event: &CycleEvent) {
        let delta: isize = match event {
            CycleEvent::Started { .. } => 1,
            CycleEvent::Finished { .. } => -1,
        };
        if let Ok(mut activity) = self.activity.lock() {
            let counter = match event.kind() {
                CycleKind::Learning => &mut activity.learning,
                CycleKind::Optimization => &mut activity.optimizing,
                CycleKind::General => return,
            };
            *counter = counter.saturating_add_signed(delta);
        }

        let current = self.state();
        if !current.is_operational() {
            debug!(cycle = %event.cycle(), state = %current, "Cycle transition suppressed");
            return;
        }
        self.transition(self.derived_state());
    }

    fn derived_state(&self) -> EcosystemState {
        self.activity
            .lock()
            .map(|activity| activity.derived_state())
            .unwrap_or(EcosystemState::Active)
    }

    fn transition(&self, next: EcosystemState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|state| {
            if *state == next || !state.can_transition_to(next) {
                return false;
            }
            from = Some(*state);
            *state = next;
            true
        });
        if let Some(from) = from {
            info!(from = %from, to = %next, "Ecosystem state changed");
        }
        changed
    }

    /// Stop everything and record the final snapshot. Safe to call twice;
    /// the second call does nothing.
    pub async fn shutdown(&self) -> ArmadaResult<ShutdownReport> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(ShutdownReport::default());
        }
        let last_state = self.state();
        info!(state = %last_state, "Shutting down ecosystem");

        self.shutdown_signal.send_replace(true);
        self.transition(EcosystemState::Shutdown);

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let mut report = ShutdownReport::default();
        for (service, result) in self.supervisor.stop_all(self.config.stop_grace).await {
            if let Err(e) = result {
                error!(service = %service, error = %e, "Failed to stop service");
                report.stop_failures.push((service, e.to_string()));
            }
        }

        let snapshot = self.snapshot_entity(last_state);
        let snapshot_id = snapshot.id.clone();
        match self.store.create_entities(vec![snapshot]).await {
            Ok(_) => report.snapshot_id = Some(snapshot_id),
            Err(e) => error!(error = %e, "Failed to record ecosystem snapshot"),
        }

        self.store.close().await?;
        info!(uptime_secs = self.uptime().as_secs(), "Ecosystem stopped");
        Ok(report)
    }

    fn snapshot_entity(&self, last_state: EcosystemState) -> KnowledgeEntity {
        let id = format!("{}:{}", ENTITY_ECOSYSTEM_SNAPSHOT, new_record_suffix());
        let mut entity = KnowledgeEntity::new(id, ENTITY_ECOSYSTEM_SNAPSHOT)
            .with_observation(format!("uptime_secs={}", self.uptime().as_secs()))
            .with_observation(format!("state_before_shutdown={}", last_state));

        for status in self.monitor.statuses() {
            entity = entity.with_observation(status.summary());
        }
        for cycle in self.scheduler.states() {
            entity = entity.with_observation(format!(
                "cycle {}: runs={} failures={} skipped={}",
                cycle.name, cycle.runs, cycle.failures, cycle.skipped
            ));
        }
        entity
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("services", &self.registry.len())
            .finish()
    }
}
