//! Error types for ARMADA operations

use std::time::Duration;
use thiserror::Error;

/// JSON-RPC code for "method not found".
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;

/// Protocol-level errors: the peer answered, but not with something usable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed response from {service}: {reason}")]
    Malformed { service: String, reason: String },

    #[error("Response from {service} carried unmatched id {id}")]
    UnmatchedId { service: String, id: String },

    #[error("Remote error from {service} ({code}): {message}")]
    Remote {
        service: String,
        code: i64,
        message: String,
    },

    #[error("Method {method} is not implemented by {service}")]
    NotImplemented { service: String, method: String },
}

/// Transport-level errors: the peer could not be reached in time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to {service} failed: {reason}")]
    ConnectFailed { service: String, reason: String },

    #[error("Call {method} on {service} timed out after {timeout:?}")]
    Timeout {
        service: String,
        method: String,
        timeout: Duration,
    },

    #[error("Connection to {service} closed")]
    Disconnected { service: String },

    #[error("{service} answered with HTTP status {status}")]
    HttpStatus { service: String, status: u16 },

    #[error("Send to {service} failed: {reason}")]
    SendFailed { service: String, reason: String },
}

/// Error returned by a single RPC call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Call {method} on {service} was cancelled")]
    Cancelled { service: String, method: String },
}

impl RpcError {
    /// True for failures that mean the service could not be reached.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }

    /// True when the peer reported the method as unknown or unimplemented.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, RpcError::Protocol(ProtocolError::NotImplemented { .. }))
    }
}

/// Process lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error("Failed to spawn {service} ({command}): {reason}")]
    SpawnFailed {
        service: String,
        command: String,
        reason: String,
    },

    #[error("Failed to stop {service}: {reason}")]
    StopFailed { service: String, reason: String },

    #[error("{service} has no local launch specification")]
    NotLocal { service: String },
}

/// Supervision policy errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisionError {
    #[error("Restart limit exceeded for {service}: {attempts} attempts")]
    RestartLimitExceeded { service: String, attempts: u32 },

    #[error("Unknown service: {service}")]
    UnknownService { service: String },
}

/// Knowledge store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Relation {from_id} -[{relation_type}]-> {to_id} references unknown entity {missing}")]
    UnknownEndpoint {
        from_id: String,
        to_id: String,
        relation_type: String,
        missing: String,
    },

    #[error("Write lock not acquired within {timeout:?}")]
    WriteTimeout { timeout: Duration },

    #[error("Knowledge store is closed")]
    Closed,

    #[error("Knowledge store lock poisoned")]
    LockPoisoned,

    #[error("Backend failure: {reason}")]
    Backend { reason: String },

    #[error("Serialization failure: {reason}")]
    Serialization { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Duplicate service name: {name}")]
    DuplicateService { name: String },

    #[error("Cycle {cycle} targets unknown service {service}")]
    UnknownStepTarget { cycle: String, service: String },

    #[error("Failed to load manifest {path}: {reason}")]
    ManifestLoad { path: String, reason: String },
}

/// Workflow execution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Unknown cycle: {cycle}")]
    UnknownCycle { cycle: String },

    #[error("Step {step} of {cycle} failed: {source}")]
    StepFailed {
        cycle: String,
        step: usize,
        #[source]
        source: RpcError,
    },

    #[error("Step {step} of {cycle} targets unknown service {service}")]
    UnknownService {
        cycle: String,
        step: usize,
        service: String,
    },

    #[error("Template error in step {step} of {cycle}: {reason}")]
    Template {
        cycle: String,
        step: usize,
        reason: String,
    },

    #[error("Cycle {cycle} is already running")]
    AlreadyRunning { cycle: String },

    #[error("Cycle {cycle} was cancelled")]
    Cancelled { cycle: String },
}

/// Master error type for all ARMADA errors.
#[derive(Debug, Clone, Error)]
pub enum ArmadaError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Supervision error: {0}")]
    Supervision(#[from] SupervisionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

impl From<ProtocolError> for ArmadaError {
    fn from(err: ProtocolError) -> Self {
        ArmadaError::Rpc(RpcError::Protocol(err))
    }
}

impl From<TransportError> for ArmadaError {
    fn from(err: TransportError) -> Self {
        ArmadaError::Rpc(RpcError::Transport(err))
    }
}

/// Result type alias for ARMADA operations.
pub type ArmadaResult<T> = Result<T, ArmadaError>;

/// Result type alias for single RPC calls.
pub type RpcResult<T> = Result<T, RpcError>;

// =============================================================================
// TESTS
// =============================================================================
