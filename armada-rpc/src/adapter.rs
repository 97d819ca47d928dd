//! In-process service adapters.
//!
//! A service with `transport = "in_process"` is answered by a
//! [`ServiceAdapter`] registered under its name. Until a real adapter is
//! registered the [`DefaultAdapter`] answers: it satisfies the base contract
//! (`initialize`, `health`) and reports every other method as not
//! implemented.

use armada_core::{
    HealthReport, ProtocolError, RpcResult, METHOD_HEALTH, METHOD_INITIALIZE,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;

/// Contract every managed service fulfils.
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    /// Service name used in errors and logs.
    fn service(&self) -> &str;

    /// Startup handshake.
    async fn initialize(&self, params: Value) -> RpcResult<Value>;

    /// Current health report.
    async fn health(&self) -> RpcResult<HealthReport>;

    /// Any declared capability method.
    async fn invoke(&self, method: &str, params: Value) -> RpcResult<Value>;

    /// Route a raw method call to the matching operation.
    async fn dispatch(&self, method: &str, params: Value) -> RpcResult<Value> {
        match method {
            METHOD_INITIALIZE => self.initialize(params).await,
            METHOD_HEALTH => Ok(self.health().await?.to_value()),
            _ => self.invoke(method, params).await,
        }
    }
}

/// Adapter that satisfies the base contract only.
#[derive(Debug, Clone)]
pub struct DefaultAdapter {
    service: String,
}

impl DefaultAdapter {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl ServiceAdapter for DefaultAdapter {
    fn service(&self) -> &str {
        &self.service
    }

    async fn initialize(&self, _params: Value) -> RpcResult<Value> {
        Ok(json!({ "service": self.service, "initialized": true }))
    }

    async fn health(&self) -> RpcResult<HealthReport> {
        Ok(HealthReport::healthy().with_extra("adapter", json!("default")))
    }

    async fn invoke(&self, method: &str, _params: Value) -> RpcResult<Value> {
        Err(ProtocolError::NotImplemented {
            service: self.service.clone(),
            method: method.to_string(),
        }
        .into())
    }
}

/// Registry of adapters for in-process services.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn ServiceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its service name.
    /// Replaces any previously registered adapter for that name.
    pub fn register(&self, adapter: Arc<dyn ServiceAdapter>) {
        self.adapters.insert(adapter.service().to_string(), adapter);
    }

    /// Adapter for `service`, falling back to the default adapter.
    pub fn get(&self, service: &str) -> Arc<dyn ServiceAdapter> {
        match self.adapters.get(service) {
            Some(adapter) => Arc::clone(adapter.value()),
            None => Arc::new(DefaultAdapter::new(service)),
        }
    }

    pub fn has(&self, service: &str) -> bool {
        self.adapters.contains_key(service)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("AdapterRegistry")
            .field("adapters", &names)
            .finish()
    }
}
