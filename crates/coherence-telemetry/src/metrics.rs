//! Prometheus text export.
//!
//! Bus metrics register themselves into the default registry (see
//! `coherence_bus::metrics`); this module adds process-level metrics and
//! renders the whole registry in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{register_int_gauge, register_int_gauge_vec, Encoder, IntGauge, IntGaugeVec, TextEncoder};

use crate::TelemetryError;

lazy_static! {
    /// Constant 1, labeled with service name and version
    pub static ref BUILD_INFO: IntGaugeVec = register_int_gauge_vec!(
        "coherence_build_info",
        "Build information for the running service",
        &["service", "version"]
    )
    .expect("Failed to create BUILD_INFO metric");

    /// Unix time the process started
    pub static ref START_TIME: IntGauge = register_int_gauge!(
        "coherence_process_start_time_seconds",
        "Start time of the process since unix epoch in seconds"
    )
    .expect("Failed to create START_TIME metric");
}

/// Set the process-level gauges.
pub fn record_build_info(service: &str) {
    BUILD_INFO
        .with_label_values(&[service, env!("CARGO_PKG_VERSION")])
        .set(1);

    let started = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    START_TIME.set(started);
}

/// Encode every metric in the default registry as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsEncode(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsEncode(e.to_string()))
}

/// Content type of [`encode_metrics`] output.
pub fn metrics_content_type() -> String {
    TextEncoder::new().format_type().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_info_exported() {
        record_build_info("coherence-test");
        let text = encode_metrics().unwrap();
        assert!(text.contains("coherence_build_info"));
        assert!(text.contains("service=\"coherence-test\""));
        assert!(START_TIME.get() > 0);
    }

    #[test]
    fn test_content_type_is_text_format() {
        assert!(metrics_content_type().starts_with("text/plain"));
    }
}
