//! # Coherence Telemetry
//!
//! Observability plumbing for coherence bus services.
//!
//! ## Components
//!
//! - **Logs**: `tracing` subscriber with env-driven filtering, pretty or JSON output
//! - **Metrics**: Prometheus text rendering of the default registry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use coherence_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).expect("Failed to init telemetry");
//!     // Logs and metrics are now being collected
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `COHERENCE_SERVICE_NAME` | `coherence-bus` | Service name |
//! | `COHERENCE_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` also honored) |
//! | `COHERENCE_CONSOLE_OUTPUT` | `true` | Write logs to stdout |
//! | `COHERENCE_JSON_LOGS` | `false` (`true` in containers) | JSON log lines |

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::{env_filter, init_logging};
pub use metrics::{encode_metrics, metrics_content_type, record_build_info, BUILD_INFO};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to encode Prometheus metrics: {0}")]
    MetricsEncode(String),
}

/// Initialize logging and process metrics.
///
/// Returns a guard to hold for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    logging::init_logging(&config)?;
    metrics::record_build_info(&config.service_name);

    Ok(TelemetryGuard {
        service_name: config.service_name,
    })
}

/// Guard that keeps telemetry active. Logs on drop.
#[derive(Debug)]
pub struct TelemetryGuard {
    service_name: String,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry");
    }
}
