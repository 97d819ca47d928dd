//! Deployment manifest
//!
//! ```toml
//! [orchestrator]
//! health_interval_secs = 30
//! error_grace_secs = 120
//! store_path = "/var/lib/armada/knowledge"
//!
//! [[services]]
//! name = "reasoner"
//! endpoint = "ws://127.0.0.1:9101"
//! transport = "persistent_channel"
//! capabilities = ["analyze"]
//! required = true
//!
//! [services.launch]
//! command = "reasoner-worker"
//! args = ["--port", "9101"]
//!
//! [[cycles]]
//! name = "learn"
//! interval_secs = 300
//! kind = "learning"
//!
//! [[cycles.steps]]
//! target_service = "reasoner"
//! method = "analyze"
//! params_template = { topic = "{{cycle.name}}" }
//! ```
//!
//! `ARMADA_*` environment variables override the `[orchestrator]` table.

use armada_core::constants::DEFAULT_STEP_TIMEOUT_SECS;
use armada_core::{
    ConfigError, CycleKind, OrchestratorConfig, ServiceDescriptor, StepSpec, WorkflowCycle,
};
use armada_fleet::ServiceRegistry;
use armada_workflow::validate_cycles;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `[orchestrator]` table. Unset keys keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorSection {
    pub health_interval_secs: Option<u64>,
    pub health_timeout_ms: Option<u64>,
    pub stop_grace_secs: Option<u64>,
    pub error_grace_secs: Option<u64>,
    /// `0` disables the startup handshake.
    pub handshake_timeout_ms: Option<u64>,
    pub evaluation_interval_secs: Option<u64>,
    pub store_path: Option<PathBuf>,
    pub store_max_size_mb: Option<usize>,
    pub store_write_timeout_ms: Option<u64>,
}

impl OrchestratorSection {
    fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(secs) = self.health_interval_secs {
            config.health.interval = Duration::from_secs(secs);
        }
        if let Some(ms) = self.health_timeout_ms {
            config.health.timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = self.stop_grace_secs {
            config.stop_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = self.error_grace_secs {
            config.error_grace_period = Duration::from_secs(secs);
        }
        if let Some(ms) = self.handshake_timeout_ms {
            config.handshake_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(secs) = self.evaluation_interval_secs {
            config.evaluation_interval = Duration::from_secs(secs);
        }
        if let Some(path) = &self.store_path {
            config.store.path = Some(path.clone());
        }
        if let Some(mb) = self.store_max_size_mb {
            config.store.max_size_mb = mb;
        }
        if let Some(ms) = self.store_write_timeout_ms {
            config.store.write_timeout = Duration::from_millis(ms);
        }
    }
}

/// One `[[cycles]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CycleSection {
    pub name: String,
    pub interval_secs: u64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub kind: CycleKind,
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

fn enabled_by_default() -> bool {
    true
}

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

impl From<CycleSection> for WorkflowCycle {
    fn from(section: CycleSection) -> Self {
        WorkflowCycle {
            name: section.name,
            interval: Duration::from_secs(section.interval_secs),
            enabled: section.enabled,
            kind: section.kind,
            step_timeout: Duration::from_secs(section.step_timeout_secs),
            steps: section.steps,
        }
    }
}

/// Parsed, not yet validated manifest.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
    #[serde(default)]
    pub cycles: Vec<CycleSection>,
}

/// Everything the orchestrator needs, checked for consistency.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub config: OrchestratorConfig,
    pub registry: ServiceRegistry,
    pub cycles: Vec<WorkflowCycle>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ManifestLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse_named(&text, &path.display().to_string())
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Self::parse_named(text, "<inline>")
    }

    fn parse_named(text: &str, name: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ManifestLoad {
            path: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Settings from the manifest alone, without environment overrides.
    pub fn config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        self.orchestrator.apply(&mut config);
        config
    }

    /// Apply environment overrides and validate services, cycles and
    /// settings together.
    pub fn resolve(self) -> Result<ResolvedManifest, ConfigError> {
        let mut config = self.config();
        config.apply_env();
        config.validate()?;

        let registry = ServiceRegistry::from_descriptors(self.services)?;
        let cycles: Vec<WorkflowCycle> = self.cycles.into_iter().map(Into::into).collect();
        validate_cycles(&cycles, &registry)?;

        Ok(ResolvedManifest {
            config,
            registry,
            cycles,
        })
    }
}
