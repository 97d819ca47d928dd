//! ARMADA Orchestrator
//!
//! Loads the deployment manifest, wires the fleet, RPC, workflow and
//! knowledge subsystems together and drives the ecosystem state machine
//! from startup to shutdown.

pub mod manifest;
pub mod orchestrator;
pub mod telemetry;

pub use manifest::{CycleSection, Manifest, OrchestratorSection, ResolvedManifest};
pub use orchestrator::{Components, Orchestrator, ShutdownReport};
pub use telemetry::{init_telemetry, TelemetryConfig};
