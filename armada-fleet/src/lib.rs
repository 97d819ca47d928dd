//! ARMADA Fleet - Registry, Supervision, Health
//!
//! - [`ServiceRegistry`]: immutable catalog of service descriptors
//! - [`ProcessSupervisor`]: owns locally hosted worker processes
//! - [`HealthMonitor`]: polls every service and drives restarts
//! - [`StatusBoard`]: per-service runtime status, written only by the monitor

pub mod monitor;
pub mod registry;
pub mod status;
pub mod supervisor;

pub use monitor::{HealthEvent, HealthMetrics, HealthMetricsSnapshot, HealthMonitor};
pub use registry::ServiceRegistry;
pub use status::StatusBoard;
pub use supervisor::ProcessSupervisor;
