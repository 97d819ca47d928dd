//! Seams between components.
//!
//! The health monitor and workflow scheduler only see these traits, so tests
//! can drive them with scripted callers and recording supervisors.

use crate::error::{ProcessError, RpcResult};
use crate::service::{ProcessHandle, ServiceDescriptor};
use async_trait::async_trait;
use std::time::Duration;

/// Issues RPC calls to managed services.
#[async_trait]
pub trait ServiceCaller: Send + Sync {
    /// Call `method` on the service described by `descriptor`.
    ///
    /// No retries happen at this layer; callers own their retry policy.
    async fn call(
        &self,
        descriptor: &ServiceDescriptor,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> RpcResult<serde_json::Value>;
}

/// Owns locally hosted worker processes.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Start the service. Starting a running service returns its handle.
    async fn start(&self, descriptor: &ServiceDescriptor) -> Result<ProcessHandle, ProcessError>;

    /// Stop the service, force-killing after `grace`. Stopping a stopped
    /// service succeeds.
    async fn stop(&self, descriptor: &ServiceDescriptor, grace: Duration) -> Result<(), ProcessError>;

    /// `stop` followed by `start`.
    async fn restart(&self, descriptor: &ServiceDescriptor) -> Result<ProcessHandle, ProcessError>;

    /// Stop everything this supervisor started.
    async fn stop_all(&self, grace: Duration) -> Vec<(String, Result<(), ProcessError>)>;

    /// Names of services with a live process.
    async fn running(&self) -> Vec<String>;
}
