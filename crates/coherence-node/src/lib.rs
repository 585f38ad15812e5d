//! # Coherence Node Runtime
//!
//! Hosts a [`CoherenceBus`] and serves its health and metrics over HTTP.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration from the environment
//! 2. Initialize logging
//! 3. Open the stream transport (Redis or in-memory)
//! 4. Connect the bus (ping, create consumer groups)
//! 5. Serve `/health`, `/metrics`, `/metrics/prometheus`
//!
//! Shutdown is the reverse: stop the HTTP server, then disconnect the bus so
//! consumer loops finish their in-flight batch.

pub mod config;
pub mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use coherence_bus::{CoherenceBus, InMemoryStreamTransport, RedisStreamTransport, StreamTransport};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub use config::{ConfigError, NodeConfig, TransportKind};
pub use server::build_router;

/// Open the transport selected by `config`.
pub async fn open_transport(config: &NodeConfig) -> Result<Arc<dyn StreamTransport>> {
    match config.transport {
        TransportKind::Redis => {
            let transport = RedisStreamTransport::connect(&config.redis_url)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Arc::new(transport))
        }
        TransportKind::Memory => Ok(Arc::new(InMemoryStreamTransport::new())),
    }
}

/// A connected bus plus its HTTP surface.
pub struct NodeRuntime {
    config: NodeConfig,
    bus: Arc<CoherenceBus>,
    shutdown_tx: watch::Sender<bool>,
}

impl NodeRuntime {
    /// Open the transport and connect the bus.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let transport = open_transport(&config).await?;
        info!(transport = transport.name(), "Stream transport ready");

        let bus = Arc::new(CoherenceBus::with_standard_channels(
            config.bus.clone(),
            transport,
        ));
        bus.connect().await.context("Failed to connect coherence bus")?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            bus,
            shutdown_tx,
        })
    }

    /// Shared handle to the bus.
    pub fn bus(&self) -> Arc<CoherenceBus> {
        Arc::clone(&self.bus)
    }

    /// Serve HTTP until [`NodeRuntime::shutdown`] is called.
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.health_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.health_addr))?;
        info!(addr = %self.config.health_addr, "Health server listening");

        let mut shutdown = self.shutdown_tx.subscribe();
        axum::serve(listener, build_router(self.bus()))
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .context("Health server failed")
    }

    /// Ask [`NodeRuntime::serve`] to stop accepting and drain in-flight requests.
    pub fn stop_serving(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Stop the HTTP server and disconnect the bus.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown...");
        self.stop_serving();
        self.bus
            .disconnect()
            .await
            .context("Failed to disconnect coherence bus")?;
        info!("Shutdown complete");
        Ok(())
    }
}
