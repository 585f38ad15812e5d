//! # Coherence Node
//!
//! Entry point: runs a coherence bus and its health server until Ctrl+C.
//!
//! See [`coherence_node::config::NodeConfig::from_env`] and
//! [`coherence_telemetry::TelemetryConfig::from_env`] for the environment
//! variables read at startup.

use std::sync::Arc;

use anyhow::{Context, Result};
use coherence_node::{NodeConfig, NodeRuntime};
use coherence_telemetry::{init_telemetry, TelemetryConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::for_service("coherence-node"))
        .context("Failed to initialize telemetry")?;

    let config = NodeConfig::from_env().context("Invalid node configuration")?;
    info!(
        transport = ?config.transport,
        health_addr = %config.health_addr,
        consumer_group = %config.bus.consumer_group,
        "Starting coherence node"
    );

    let runtime = Arc::new(NodeRuntime::start(config).await?);
    let mut server = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.serve().await })
    };

    let served = tokio::select! {
        joined = &mut server => joined,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Shutdown signal received");
            // Let in-flight requests finish before the bus goes away
            runtime.stop_serving();
            server.await
        }
    };

    let served = served.context("Health server task panicked")?;
    if let Err(e) = &served {
        error!(error = %e, "Health server stopped");
    }
    runtime.shutdown().await?;
    served
}
