//! Service registry

use armada_core::{ConfigError, ServiceDescriptor, Transport};
use std::collections::HashMap;

/// Immutable catalog of managed services, in declaration order.
///
/// Built once from validated descriptors. Reloading means building a new
/// registry.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: Vec<ServiceDescriptor>,
    index: HashMap<String, usize>,
}

impl ServiceRegistry {
    /// Validate and index `descriptors`.
    ///
    /// # Errors
    ///
    /// - `ConfigError::DuplicateService` when two descriptors share a name
    /// - `ConfigError::InvalidValue` for an empty name, a missing endpoint on
    ///   a remote transport or a zero failure threshold
    pub fn from_descriptors(descriptors: Vec<ServiceDescriptor>) -> Result<Self, ConfigError> {
        let mut index = HashMap::with_capacity(descriptors.len());

        for (position, descriptor) in descriptors.iter().enumerate() {
            validate(descriptor)?;
            if index.insert(descriptor.name.clone(), position).is_some() {
                return Err(ConfigError::DuplicateService {
                    name: descriptor.name.clone(),
                });
            }
        }

        Ok(Self {
            services: descriptors,
            index,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.index.get(name).map(|&i| &self.services[i])
    }

    pub fn all(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }

    /// Services whose sustained failure degrades the ecosystem.
    pub fn required(&self) -> Vec<&ServiceDescriptor> {
        self.services.iter().filter(|s| s.required).collect()
    }

    /// Services whose process the orchestrator owns.
    pub fn local(&self) -> Vec<&ServiceDescriptor> {
        self.services.iter().filter(|s| s.is_local()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn validate(descriptor: &ServiceDescriptor) -> Result<(), ConfigError> {
    if descriptor.name.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "services.name".to_string(),
            value: descriptor.name.clone(),
            reason: "service name must not be empty".to_string(),
        });
    }
    if descriptor.transport != Transport::InProcess && descriptor.endpoint.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: format!("services.{}.endpoint", descriptor.name),
            value: descriptor.endpoint.clone(),
            reason: "remote transports need an endpoint".to_string(),
        });
    }
    if descriptor.restart_policy.max_consecutive_failures == 0 {
        return Err(ConfigError::InvalidValue {
            field: format!("services.{}.restart_policy.max_consecutive_failures", descriptor.name),
            value: "0".to_string(),
            reason: "failure threshold must be at least 1".to_string(),
        });
    }
    if let Some(launch) = &descriptor.launch {
        if launch.command.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("services.{}.launch.command", descriptor.name),
                value: launch.command.clone(),
                reason: "launch command must not be empty".to_string(),
            });
        }
    }
    Ok(())
}
