//! ARMADA Workflow - Scheduled Automation Cycles
//!
//! A cycle is an ordered list of RPC steps run on a fixed interval. Each
//! step's parameters are rendered from earlier results, and every run ends
//! in exactly one knowledge entity: `cycle_result` or `cycle_failure`.

pub mod scheduler;
pub mod template;

pub use scheduler::{cycle_entity_id, validate_cycles, CycleEvent, WorkflowScheduler};
pub use template::{render, TemplateContext};
