//! Health check payloads
//!
//! Every managed service answers `health` with `{ status, timestamp }`. This
//! module parses that payload and decides whether the answer counts as a
//! passing check.

use crate::error::ProtocolError;
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health status reported by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Operational but degraded
    Degraded,
    /// Not operational
    Unhealthy,
    /// Anything the service reported that we do not recognise
    #[serde(other)]
    Unknown,
}

impl HealthStatus {
    /// Whether this status counts as a successful check.
    ///
    /// A degraded service is still serving requests, so it passes.
    pub fn is_serving(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Body of a `health` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    /// Additional fields the service chose to include
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl HealthReport {
    /// A healthy report stamped with the current time.
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            timestamp: Some(chrono::Utc::now()),
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Parse a `health` result, treating a missing or non-string `status` as
    /// a malformed response.
    pub fn from_value(service: &str, value: serde_json::Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
            service: service.to_string(),
            reason: format!("invalid health payload: {}", e),
        })
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
