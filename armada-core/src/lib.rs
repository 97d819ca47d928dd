//! ARMADA Core - Shared Types
//!
//! Data types, error taxonomy, configuration and the trait seams shared by
//! every other crate. No I/O lives here.

use chrono::{DateTime, Utc};

pub mod config;
pub mod constants;
pub mod error;
pub mod health;
pub mod knowledge;
pub mod rpc;
pub mod service;
pub mod state;
pub mod traits;
pub mod workflow;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use config::{HealthConfig, OrchestratorConfig, StoreConfig};
pub use error::{
    ArmadaError, ArmadaResult, ConfigError, ProcessError, ProtocolError, RpcError, RpcResult,
    StoreError, SupervisionError, TransportError, WorkflowError, METHOD_NOT_FOUND_CODE,
};
pub use health::{HealthReport, HealthStatus};
pub use knowledge::{
    KnowledgeEntity, KnowledgeRelation, RejectedRelation, RelationOutcome, ENTITY_CYCLE_FAILURE,
    ENTITY_CYCLE_RESULT, ENTITY_ECOSYSTEM_SNAPSHOT, ENTITY_WORKFLOW_CYCLE, RELATION_RECORDED_FOR,
};
pub use rpc::{
    RpcErrorObject, RpcId, RpcOutcome, RpcRequest, RpcResponse, METHOD_HEALTH, METHOD_INITIALIZE,
};
pub use service::{
    LaunchSpec, ProcessHandle, RestartPolicy, ServiceDescriptor, ServiceState, ServiceStatus,
    Transport,
};
pub use state::EcosystemState;
pub use traits::{ProcessControl, ServiceCaller};
pub use workflow::{CycleKind, CycleOutcome, CycleState, StepSpec, WorkflowCycle};

/// Generate a timestamp-sortable unique suffix for entity ids.
pub fn new_record_suffix() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}
