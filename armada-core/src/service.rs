//! Service descriptors and runtime status

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

/// How a service is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// One long-lived WebSocket, calls multiplexed by id.
    PersistentChannel,
    /// One HTTP POST per call over a pooled client.
    RequestResponse,
    /// Served inside the orchestrator by a registered adapter.
    InProcess,
}

/// Restart policy applied by the health monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Consecutive failed checks before the service is considered in error.
    pub max_consecutive_failures: u32,
    /// Minimum time between two restart attempts.
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
    /// Restarts allowed between two healthy checks; `None` means unbounded.
    #[serde(default)]
    pub max_restart_attempts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            cooldown: Duration::from_secs(60),
            max_restart_attempts: None,
        }
    }
}

/// How to launch a locally hosted worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Identity of a managed service. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub endpoint: String,
    pub transport: Transport,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Sustained failure of a required service degrades the whole ecosystem.
    #[serde(default)]
    pub required: bool,
    /// Present for locally hosted services only.
    #[serde(default)]
    pub launch: Option<LaunchSpec>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, transport: Transport) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            transport,
            capabilities: BTreeSet::new(),
            restart_policy: RestartPolicy::default(),
            required: false,
            launch: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_launch(mut self, launch: LaunchSpec) -> Self {
        self.launch = Some(launch);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Whether the orchestrator owns this service's process.
    pub fn is_local(&self) -> bool {
        self.launch.is_some()
    }

    /// Whether `method` may be called on this service.
    ///
    /// `initialize` and `health` are part of the base contract and always
    /// allowed; anything else must be declared as a capability.
    pub fn supports(&self, method: &str) -> bool {
        method == crate::rpc::METHOD_INITIALIZE
            || method == crate::rpc::METHOD_HEALTH
            || self.capabilities.contains(method)
    }
}

/// Lifecycle state of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Unknown,
    Starting,
    Active,
    Unhealthy,
    Error,
}

impl ServiceState {
    pub const ALL: [ServiceState; 5] = [
        ServiceState::Unknown,
        ServiceState::Starting,
        ServiceState::Active,
        ServiceState::Unhealthy,
        ServiceState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Unknown => "unknown",
            ServiceState::Starting => "starting",
            ServiceState::Active => "active",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Error => "error",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable runtime status of a service, owned by the health monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub last_check: Option<Timestamp>,
    pub consecutive_failures: u32,
    pub last_restart: Option<Timestamp>,
    /// Restart attempts since the last healthy check.
    pub restart_attempts: u32,
    /// First entry into `error` since the last healthy check.
    pub error_since: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl ServiceStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ServiceState::Unknown,
            last_check: None,
            consecutive_failures: 0,
            last_restart: None,
            restart_attempts: 0,
            error_since: None,
            last_error: None,
        }
    }

    /// One-line summary used in logs and knowledge snapshots.
    pub fn summary(&self) -> String {
        let last_check = self
            .last_check
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let mut line = format!(
            "service {}: state={} consecutive_failures={} restarts={} last_check={}",
            self.name, self.state, self.consecutive_failures, self.restart_attempts, last_check
        );
        if let Some(err) = &self.last_error {
            line.push_str(&format!(" last_error={}", err));
        }
        line
    }
}

/// Handle to a running supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub service: String,
    pub pid: Option<u32>,
    pub started_at: Timestamp,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_supports_base_contract_and_capabilities() {
        let descriptor = ServiceDescriptor::new("reasoner", "ws://127.0.0.1:9101", Transport::PersistentChannel)
            .with_capabilities(["analyze"]);
        assert!(descriptor.supports("health"));
        assert!(descriptor.supports("initialize"));
        assert!(descriptor.supports("analyze"));
        assert!(!descriptor.supports("optimize"));
    }

    #[test]
    fn test_descriptor_local_only_with_launch() {
        let external = ServiceDescriptor::new("graph", "http://10.0.0.2:7000/rpc", Transport::RequestResponse);
        assert!(!external.is_local());
        let local = external.with_launch(LaunchSpec::new("graph-server").with_args(["--port", "7000"]));
        assert!(local.is_local());
    }

    #[test]
    fn test_transport_serde_names() {
        let json = serde_json::to_string(&Transport::PersistentChannel).unwrap();
        assert_eq!(json, "\"persistent_channel\"");
        let parsed: Transport = serde_json::from_str("\"request_response\"").unwrap();
        assert_eq!(parsed, Transport::RequestResponse);
    }

    #[test]
    fn test_new_status_is_unknown_with_zero_failures() {
        let status = ServiceStatus::new("bridge");
        assert_eq!(status.state, ServiceState::Unknown);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.summary().contains("state=unknown"));
        assert!(status.summary().contains("last_check=never"));
    }
}
