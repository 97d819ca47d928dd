//! Workflow cycle definitions

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tag that drives transient orchestrator states while a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    #[default]
    General,
    Learning,
    Optimization,
}

/// One RPC call within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub target_service: String,
    pub method: String,
    /// Parameters with `{{...}}` placeholders filled from earlier results.
    #[serde(default = "empty_template")]
    pub params_template: serde_json::Value,
}

impl StepSpec {
    pub fn new(target_service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target_service: target_service.into(),
            method: method.into(),
            params_template: empty_template(),
        }
    }

    pub fn with_params(mut self, params_template: serde_json::Value) -> Self {
        self.params_template = params_template;
        self
    }
}

fn empty_template() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A named, independently scheduled automation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCycle {
    pub name: String,
    pub interval: Duration,
    pub enabled: bool,
    #[serde(default)]
    pub kind: CycleKind,
    /// Per-step call timeout.
    pub step_timeout: Duration,
    pub steps: Vec<StepSpec>,
}

impl WorkflowCycle {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            enabled: true,
            kind: CycleKind::General,
            step_timeout: Duration::from_secs(30),
            steps: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: CycleKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// How a cycle run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum CycleOutcome {
    /// `entity_id` is `None` when the result could not be recorded.
    Succeeded { entity_id: Option<String> },
    Failed { step: Option<usize>, error: String },
    Cancelled,
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Succeeded { .. })
    }
}

/// Runtime bookkeeping for one cycle, maintained by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleState {
    pub name: String,
    pub kind: CycleKind,
    pub last_run: Option<Timestamp>,
    pub last_outcome: Option<CycleOutcome>,
    pub runs: u64,
    pub failures: u64,
    pub skipped: u64,
    pub running: bool,
}

impl CycleState {
    pub fn new(name: impl Into<String>, kind: CycleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            last_run: None,
            last_outcome: None,
            runs: 0,
            failures: 0,
            skipped: 0,
            running: false,
        }
    }
}
