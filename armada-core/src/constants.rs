//! Default values used across ARMADA.
//!
//! Centralizing these keeps `Default` impls and `from_env` readers in sync.

// ============================================================================
// HEALTH MONITORING
// ============================================================================

/// Default interval between health checks of one service (seconds)
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

/// Default timeout of a single health call (milliseconds)
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;

/// Capacity of the health event broadcast channel
pub const HEALTH_EVENT_CAPACITY: usize = 256;

// ============================================================================
// SUPERVISION
// ============================================================================

/// Default grace period between SIGTERM and SIGKILL (seconds)
pub const DEFAULT_STOP_GRACE_SECS: u64 = 10;

/// Default time a required service may sit in error before the ecosystem is
/// flagged degraded (seconds)
pub const DEFAULT_ERROR_GRACE_SECS: u64 = 120;

/// Default timeout of the startup `initialize` handshake (milliseconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default interval of the orchestrator's own state evaluation (seconds)
pub const DEFAULT_EVALUATION_INTERVAL_SECS: u64 = 5;

// ============================================================================
// KNOWLEDGE STORE
// ============================================================================

/// Default maximum wait for the knowledge store writer lock (milliseconds)
pub const DEFAULT_STORE_WRITE_TIMEOUT_MS: u64 = 2_000;

/// Default LMDB map size (megabytes)
pub const DEFAULT_STORE_MAX_SIZE_MB: usize = 256;

/// Longest step summary written into a knowledge observation (characters)
pub const MAX_OBSERVATION_SUMMARY_CHARS: usize = 240;

// ============================================================================
// WORKFLOWS
// ============================================================================

/// Capacity of the cycle event broadcast channel
pub const CYCLE_EVENT_CAPACITY: usize = 256;

/// Default per-step call timeout (seconds)
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 30;
