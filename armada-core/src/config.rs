//! Configuration types

use crate::constants::*;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn positive(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: format!("{:?}", value),
            reason: format!("{} must be positive", field),
        });
    }
    Ok(())
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How often each service is polled
    pub interval: Duration,
    /// Timeout of a single `health` call
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            timeout: Duration::from_millis(DEFAULT_HEALTH_TIMEOUT_MS),
        }
    }
}

impl HealthConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// - `ARMADA_HEALTH_INTERVAL_SECS` (default: 30)
    /// - `ARMADA_HEALTH_TIMEOUT_MS` (default: 5000)
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_secs(
                env_u64("ARMADA_HEALTH_INTERVAL_SECS").unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
            ),
            timeout: Duration::from_millis(
                env_u64("ARMADA_HEALTH_TIMEOUT_MS").unwrap_or(DEFAULT_HEALTH_TIMEOUT_MS),
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("health.interval", self.interval)?;
        positive("health.timeout", self.timeout)?;
        if self.timeout > self.interval {
            return Err(ConfigError::InvalidValue {
                field: "health.timeout".to_string(),
                value: format!("{:?}", self.timeout),
                reason: "health.timeout must not exceed health.interval".to_string(),
            });
        }
        Ok(())
    }
}

/// Knowledge store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// LMDB directory; `None` keeps the store in memory only
    pub path: Option<PathBuf>,
    pub max_size_mb: usize,
    /// Maximum wait for the single writer path
    pub write_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_size_mb: DEFAULT_STORE_MAX_SIZE_MB,
            write_timeout: Duration::from_millis(DEFAULT_STORE_WRITE_TIMEOUT_MS),
        }
    }
}

impl StoreConfig {
    /// - `ARMADA_STORE_PATH` (default: in-memory)
    /// - `ARMADA_STORE_WRITE_TIMEOUT_MS` (default: 2000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            path: std::env::var("ARMADA_STORE_PATH").ok().map(PathBuf::from),
            max_size_mb: defaults.max_size_mb,
            write_timeout: Duration::from_millis(
                env_u64("ARMADA_STORE_WRITE_TIMEOUT_MS").unwrap_or(DEFAULT_STORE_WRITE_TIMEOUT_MS),
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("store.write_timeout", self.write_timeout)?;
        if self.max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.max_size_mb".to_string(),
                value: "0".to_string(),
                reason: "store.max_size_mb must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub health: HealthConfig,
    pub store: StoreConfig,
    /// Grace period for SIGTERM before SIGKILL
    pub stop_grace: Duration,
    /// How long a required service may stay in error before the ecosystem
    /// enters `error`
    pub error_grace_period: Duration,
    /// Timeout of the startup `initialize` call; `None` skips the handshake
    pub handshake_timeout: Option<Duration>,
    /// Interval of the orchestrator's own evaluation tick
    pub evaluation_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            store: StoreConfig::default(),
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
            error_grace_period: Duration::from_secs(DEFAULT_ERROR_GRACE_SECS),
            handshake_timeout: Some(Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS)),
            evaluation_interval: Duration::from_secs(DEFAULT_EVALUATION_INTERVAL_SECS),
        }
    }
}

impl OrchestratorConfig {
    /// - `ARMADA_STOP_GRACE_SECS` (default: 10)
    /// - `ARMADA_ERROR_GRACE_SECS` (default: 120)
    /// - `ARMADA_HANDSHAKE_TIMEOUT_MS` (default: 10000, `0` disables)
    /// - plus the health and store variables
    pub fn from_env() -> Self {
        let handshake_ms =
            env_u64("ARMADA_HANDSHAKE_TIMEOUT_MS").unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS);
        Self {
            health: HealthConfig::from_env(),
            store: StoreConfig::from_env(),
            stop_grace: Duration::from_secs(
                env_u64("ARMADA_STOP_GRACE_SECS").unwrap_or(DEFAULT_STOP_GRACE_SECS),
            ),
            error_grace_period: Duration::from_secs(
                env_u64("ARMADA_ERROR_GRACE_SECS").unwrap_or(DEFAULT_ERROR_GRACE_SECS),
            ),
            handshake_timeout: (handshake_ms > 0).then(|| Duration::from_millis(handshake_ms)),
            evaluation_interval: Duration::from_secs(DEFAULT_EVALUATION_INTERVAL_SECS),
        }
    }

    /// Override fields whose `ARMADA_*` variable is set, leaving the rest
    /// untouched. Used on top of manifest settings.
    pub fn apply_env(&mut self) {
        if let Some(secs) = env_u64("ARMADA_HEALTH_INTERVAL_SECS") {
            self.health.interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("ARMADA_HEALTH_TIMEOUT_MS") {
            self.health.timeout = Duration::from_millis(ms);
        }
        if let Ok(path) = std::env::var("ARMADA_STORE_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(ms) = env_u64("ARMADA_STORE_WRITE_TIMEOUT_MS") {
            self.store.write_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("ARMADA_STOP_GRACE_SECS") {
            self.stop_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("ARMADA_ERROR_GRACE_SECS") {
            self.error_grace_period = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("ARMADA_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.health.validate()?;
        self.store.validate()?;
        positive("stop_grace", self.stop_grace)?;
        positive("evaluation_interval", self.evaluation_interval)?;
        if let Some(timeout) = self.handshake_timeout {
            positive("handshake_timeout", timeout)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = OrchestratorConfig::default();
        config.health.interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "health.interval"));
    }

    #[test]
    fn test_health_timeout_longer_than_interval_rejected() {
        let config = HealthConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_error_grace_is_allowed() {
        let config = OrchestratorConfig {
            error_grace_period: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_defaults_to_memory() {
        let config = StoreConfig::default();
        assert!(config.path.is_none());
        assert!(config.validate().is_ok());
    }
}
