//! Workflow scheduler
//!
//! Every enabled cycle gets its own interval task. Each tick spawns one run;
//! a run that finds the previous run of the same cycle still in flight is
//! skipped and counted, never queued. Different cycles never wait on each
//! other.

use crate::template::{render, TemplateContext};
use armada_core::constants::{CYCLE_EVENT_CAPACITY, MAX_OBSERVATION_SUMMARY_CHARS};
use armada_core::{
    new_record_suffix, ConfigError, CycleKind, CycleOutcome, CycleState, KnowledgeEntity,
    KnowledgeRelation, ProtocolError, RpcError, ServiceCaller, StoreError, Timestamp,
    WorkflowCycle, WorkflowError, ENTITY_CYCLE_FAILURE, ENTITY_CYCLE_RESULT,
    ENTITY_WORKFLOW_CYCLE, RELATION_RECORDED_FOR,
};
use armada_fleet::ServiceRegistry;
use armada_knowledge::KnowledgeStore;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, error, info, warn};

// ============================================================================
// EVENTS
// ============================================================================

/// Cycle lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CycleEvent {
    Started {
        cycle: String,
        kind: CycleKind,
        at: Timestamp,
    },
    Finished {
        cycle: String,
        kind: CycleKind,
        outcome: CycleOutcome,
        at: Timestamp,
    },
}

impl CycleEvent {
    pub fn cycle(&self) -> &str {
        match self {
            CycleEvent::Started { cycle, .. } | CycleEvent::Finished { cycle, .. } => cycle,
        }
    }

    pub fn kind(&self) -> CycleKind {
        match self {
            CycleEvent::Started { kind, .. } | CycleEvent::Finished { kind, .. } => *kind,
        }
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Check cycle definitions against the registry.
///
/// # Errors
///
/// - `ConfigError::InvalidValue` for duplicate or empty cycle names, an
///   enabled cycle with a zero interval, or a zero step timeout
/// - `ConfigError::UnknownStepTarget` when a step names an unregistered
///   service
pub fn validate_cycles(
    cycles: &[WorkflowCycle],
    registry: &ServiceRegistry,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for cycle in cycles {
        if cycle.name.trim().is_empty() || !seen.insert(cycle.name.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "cycles.name".to_string(),
                value: cycle.name.clone(),
                reason: "cycle names must be unique and non-empty".to_string(),
            });
        }
        if cycle.enabled && cycle.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: format!("cycles.{}.interval", cycle.name),
                value: "0".to_string(),
                reason: "enabled cycles need a positive interval".to_string(),
            });
        }
        if cycle.step_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: format!("cycles.{}.step_timeout", cycle.name),
                value: "0".to_string(),
                reason: "step timeout must be positive".to_string(),
            });
        }
        for step in &cycle.steps {
            if registry.get(&step.target_service).is_none() {
                return Err(ConfigError::UnknownStepTarget {
                    cycle: cycle.name.clone(),
                    service: step.target_service.clone(),
                });
            }
        }
    }
    Ok(())
}

// ============================================================================
// SCHEDULER
// ============================================================================

struct CycleSlot {
    cycle: WorkflowCycle,
    running: AtomicBool,
    state: Mutex<CycleState>,
}

impl CycleSlot {
    fn update<R>(&self, f: impl FnOnce(&mut CycleState) -> R) -> Option<R> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }
}

/// Clears the overlap flag when a run ends, including when the run's task
/// is aborted mid-flight.
struct RunGuard<'a> {
    slot: &'a CycleSlot,
    events: &'a broadcast::Sender<CycleEvent>,
    finished: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let now = Utc::now();
            self.slot.update(|state| {
                state.last_run = Some(now);
                state.last_outcome = Some(CycleOutcome::Cancelled);
                state.running = false;
            });
            let _ = self.events.send(CycleEvent::Finished {
                cycle: self.slot.cycle.name.clone(),
                kind: self.slot.cycle.kind,
                outcome: CycleOutcome::Cancelled,
                at: now,
            });
            info!(cycle = %self.slot.cycle.name, "Cycle run cancelled");
        }
        self.slot.running.store(false, Ordering::Release);
    }
}

/// One successful step.
struct StepResult {
    service: String,
    method: String,
    result: Value,
}

/// Where a run stopped.
struct StepFailure {
    step: Option<usize>,
    error: WorkflowError,
}

pub struct WorkflowScheduler {
    slots: Vec<Arc<CycleSlot>>,
    index: HashMap<String, usize>,
    registry: Arc<ServiceRegistry>,
    caller: Arc<dyn ServiceCaller>,
    store: Arc<KnowledgeStore>,
    events: broadcast::Sender<CycleEvent>,
}

impl WorkflowScheduler {
    /// Build a scheduler over `cycles`. Cycle names must be unique; use
    /// [`validate_cycles`] to also check step targets up front.
    pub fn new(
        cycles: Vec<WorkflowCycle>,
        registry: Arc<ServiceRegistry>,
        caller: Arc<dyn ServiceCaller>,
        store: Arc<KnowledgeStore>,
    ) -> Self {
        let mut slots = Vec::with_capacity(cycles.len());
        let mut index = HashMap::with_capacity(cycles.len());
        for cycle in cycles {
            if index.contains_key(&cycle.name) {
                warn!(cycle = %cycle.name, "Duplicate cycle name ignored");
                continue;
            }
            index.insert(cycle.name.clone(), slots.len());
            slots.push(Arc::new(CycleSlot {
                state: Mutex::new(CycleState::new(&cycle.name, cycle.kind)),
                running: AtomicBool::new(false),
                cycle,
            }));
        }
        let (events, _) = broadcast::channel(CYCLE_EVENT_CAPACITY);

        Self {
            slots,
            index,
            registry,
            caller,
            store,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.events.subscribe()
    }

    pub fn cycles(&self) -> Vec<&WorkflowCycle> {
        self.slots.iter().map(|slot| &slot.cycle).collect()
    }

    pub fn state(&self, name: &str) -> Option<CycleState> {
        let slot = self.slot(name).ok()?;
        slot.state.lock().ok().map(|state| state.clone())
    }

    /// Runtime state of every cycle, in declaration order.
    pub fn states(&self) -> Vec<CycleState> {
        self.slots
            .iter()
            .filter_map(|slot| slot.state.lock().ok().map(|state| state.clone()))
            .collect()
    }

    /// Run `name` immediately, outside its schedule.
    ///
    /// Disabled cycles can still be run this way.
    ///
    /// # Errors
    ///
    /// `UnknownCycle` for an unregistered name and `AlreadyRunning` when a
    /// run of the same cycle is in flight. Step failures are reported in the
    /// returned outcome, not as an error.
    pub async fn run_now(&self, name: &str) -> Result<CycleOutcome, WorkflowError> {
        let slot = Arc::clone(self.slot(name)?);
        self.run_slot(&slot).await
    }

    /// Spawn one interval task per enabled cycle. Each task stops, and aborts
    /// its in-flight runs, when `shutdown` flips to `true`.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.slots
            .iter()
            .filter(|slot| slot.cycle.enabled)
            .map(|slot| {
                let scheduler = Arc::clone(self);
                let slot = Arc::clone(slot);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let period = slot.cycle.interval;
                    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    let mut runs: Vec<JoinHandle<()>> = Vec::new();

                    info!(
                        cycle = %slot.cycle.name,
                        interval_secs = period.as_secs(),
                        steps = slot.cycle.steps.len(),
                        "Cycle scheduled"
                    );
                    loop {
                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                            _ = ticker.tick() => {
                                runs.retain(|run| !run.is_finished());
                                let scheduler = Arc::clone(&scheduler);
                                let slot = Arc::clone(&slot);
                                runs.push(tokio::spawn(async move {
                                    let _ = scheduler.run_slot(&slot).await;
                                }));
                            }
                        }
                    }

                    for run in runs {
                        run.abort();
                        let _ = run.await;
                    }
                    debug!(cycle = %slot.cycle.name, "Cycle loop stopped");
                })
            })
            .collect()
    }

    fn slot(&self, name: &str) -> Result<&Arc<CycleSlot>, WorkflowError> {
        self.index
            .get(name)
            .map(|&i| &self.slots[i])
            .ok_or_else(|| WorkflowError::UnknownCycle {
                cycle: name.to_string(),
            })
    }

    async fn run_slot(&self, slot: &CycleSlot) -> Result<CycleOutcome, WorkflowError> {
        let cycle = &slot.cycle;
        if slot
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            slot.update(|state| state.skipped += 1);
            info!(cycle = %cycle.name, "Previous run still in flight, skipping trigger");
            return Err(WorkflowError::AlreadyRunning {
                cycle: cycle.name.clone(),
            });
        }
        let mut guard = RunGuard {
            slot,
            events: &self.events,
            finished: false,
        };

        let started_at = Utc::now();
        slot.update(|state| state.running = true);
        let _ = self.events.send(CycleEvent::Started {
            cycle: cycle.name.clone(),
            kind: cycle.kind,
            at: started_at,
        });
        debug!(cycle = %cycle.name, kind = ?cycle.kind, "Cycle run started");

        let clock = Instant::now();
        let outcome = match self.execute(cycle).await {
            Ok(results) => {
                let elapsed_ms = clock.elapsed().as_millis() as u64;
                let entity_id = self.record_success(cycle, &results, elapsed_ms).await;
                info!(cycle = %cycle.name, steps = results.len(), elapsed_ms, "Cycle completed");
                CycleOutcome::Succeeded { entity_id }
            }
            Err(failure) => {
                warn!(cycle = %cycle.name, step = ?failure.step, error = %failure.error, "Cycle failed");
                self.record_failure(cycle, &failure).await;
                CycleOutcome::Failed {
                    step: failure.step,
                    error: failure.error.to_string(),
                }
            }
        };

        let finished_at = Utc::now();
        slot.update(|state| {
            state.last_run = Some(finished_at);
            state.last_outcome = Some(outcome.clone());
            state.runs += 1;
            if !outcome.is_success() {
                state.failures += 1;
            }
            state.running = false;
        });
        guard.finished = true;
        drop(guard);

        let _ = self.events.send(CycleEvent::Finished {
            cycle: cycle.name.clone(),
            kind: cycle.kind,
            outcome: outcome.clone(),
            at: finished_at,
        });
        Ok(outcome)
    }

    /// Run the steps in order. The first failure aborts the run and the
    /// results gathered so far are dropped.
    async fn execute(&self, cycle: &WorkflowCycle) -> Result<Vec<StepResult>, StepFailure> {
        let mut results: Vec<StepResult> = Vec::with_capacity(cycle.steps.len());
        let mut values: Vec<Value> = Vec::with_capacity(cycle.steps.len());

        for (step, spec) in cycle.steps.iter().enumerate() {
            let fail = |error| StepFailure {
                step: Some(step),
                error,
            };

            let descriptor = self.registry.get(&spec.target_service).ok_or_else(|| {
                fail(WorkflowError::UnknownService {
                    cycle: cycle.name.clone(),
                    step,
                    service: spec.target_service.clone(),
                })
            })?;

            if !descriptor.supports(&spec.method) {
                return Err(fail(WorkflowError::StepFailed {
                    cycle: cycle.name.clone(),
                    step,
                    source: RpcError::Protocol(ProtocolError::NotImplemented {
                        service: descriptor.name.clone(),
                        method: spec.method.clone(),
                    }),
                }));
            }

            let params = render(&spec.params_template, &TemplateContext::new(&cycle.name, &values))
                .map_err(|reason| {
                    fail(WorkflowError::Template {
                        cycle: cycle.name.clone(),
                        step,
                        reason,
                    })
                })?;

            debug!(cycle = %cycle.name, step, service = %descriptor.name, method = %spec.method, "Calling step");
            let result = self
                .caller
                .call(descriptor, &spec.method, params, cycle.step_timeout)
                .await
                .map_err(|source| {
                    fail(WorkflowError::StepFailed {
                        cycle: cycle.name.clone(),
                        step,
                        source,
                    })
                })?;

            values.push(result.clone());
            results.push(StepResult {
                service: descriptor.name.clone(),
                method: spec.method.clone(),
                result,
            });
        }

        Ok(results)
    }

    async fn record_success(
        &self,
        cycle: &WorkflowCycle,
        results: &[StepResult],
        elapsed_ms: u64,
    ) -> Option<String> {
        let id = format!("{}:{}:{}", ENTITY_CYCLE_RESULT, cycle.name, new_record_suffix());
        let mut entity = KnowledgeEntity::new(&id, ENTITY_CYCLE_RESULT)
            .with_observation(format!(
                "cycle {} completed {} steps in {} ms",
                cycle.name,
                results.len(),
                elapsed_ms
            ));
        for (i, step) in results.iter().enumerate() {
            entity = entity.with_observation(format!(
                "step {} {}.{}: {}",
                i,
                step.service,
                step.method,
                summarize(&step.result)
            ));
        }

        match self.record(cycle, entity).await {
            Ok(()) => Some(id),
            Err(e) => {
                error!(cycle = %cycle.name, error = %e, "Failed to record cycle result");
                None
            }
        }
    }

    async fn record_failure(&self, cycle: &WorkflowCycle, failure: &StepFailure) {
        let id = format!("{}:{}:{}", ENTITY_CYCLE_FAILURE, cycle.name, new_record_suffix());
        let mut entity =
            KnowledgeEntity::new(&id, ENTITY_CYCLE_FAILURE).with_observation(failure.error.to_string());
        if let Some(step) = failure.step {
            if let Some(spec) = cycle.steps.get(step) {
                entity = entity.with_observation(format!(
                    "failed at step {} {}.{}",
                    step, spec.target_service, spec.method
                ));
            }
        }

        if let Err(e) = self.record(cycle, entity).await {
            error!(cycle = %cycle.name, error = %e, "Failed to record cycle failure");
        }
    }

    /// Store `entity` and link it to the cycle's own entity.
    async fn record(&self, cycle: &WorkflowCycle, entity: KnowledgeEntity) -> Result<(), StoreError> {
        let cycle_id = cycle_entity_id(&cycle.name);
        let relation = KnowledgeRelation::new(&entity.id, &cycle_id, RELATION_RECORDED_FOR);
        let cycle_entity = KnowledgeEntity::new(&cycle_id, ENTITY_WORKFLOW_CYCLE)
            .with_observation(format!("kind={:?}", cycle.kind).to_lowercase())
            .with_observation(format!("interval_secs={}", cycle.interval.as_secs()));

        self.store.create_entities(vec![cycle_entity, entity]).await?;
        let outcome = self.store.create_relations(vec![relation]).await?;
        if let Some(rejected) = outcome.rejected.first() {
            return Err(rejected.reason.clone());
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowScheduler")
            .field("cycles", &self.index.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Id of the per-cycle entity results are linked to.
pub fn cycle_entity_id(cycle: &str) -> String {
    format!("{}:{}", ENTITY_WORKFLOW_CYCLE, cycle)
}

fn summarize(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= MAX_OBSERVATION_SUMMARY_CHARS {
        return text;
    }
    let mut truncated: String = text.chars().take(MAX_OBSERVATION_SUMMARY_CHARS).collect();
    truncated.push_str("...");
    truncated
}
