//! ARMADA entry point
//!
//! Usage: `armada [MANIFEST]`. The manifest path falls back to
//! `ARMADA_MANIFEST`, then `armada.toml`.

use std::path::PathBuf;
use std::sync::Arc;

use armada_core::{ArmadaResult, ServiceCaller};
use armada_orchestrator::{init_telemetry, Manifest, Orchestrator, TelemetryConfig};
use armada_rpc::ProtocolClient;

#[tokio::main]
async fn main() -> ArmadaResult<()> {
    if let Err(e) = init_telemetry(&TelemetryConfig::from_env()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let path = manifest_path();
    tracing::info!(path = %path.display(), "Loading manifest");
    let resolved = Manifest::load(&path)?.resolve()?;

    let client = Arc::new(ProtocolClient::new());
    let caller: Arc<dyn ServiceCaller> = client.clone();
    let orchestrator = Arc::new(Orchestrator::assemble(resolved, caller)?);

    orchestrator.start().await?;
    tracing::info!(state = %orchestrator.state(), "Ecosystem running");

    wait_for_signal().await;
    tracing::info!("Shutdown signal received");

    let report = orchestrator.shutdown().await?;
    client.close();
    if !report.stop_failures.is_empty() {
        tracing::warn!(failures = report.stop_failures.len(), "Some services did not stop cleanly");
    }
    Ok(())
}

fn manifest_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ARMADA_MANIFEST").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("armada.toml"))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
