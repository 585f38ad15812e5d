//! # Bus Metrics
//!
//! Prometheus metrics for the coherence bus.
//!
//! Enable with the `metrics` feature:
//! ```toml
//! coherence-bus = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `coherence_bus_messages_published_total` - Counter of published messages (by channel)
//! - `coherence_bus_messages_consumed_total` - Counter of consumed messages (by channel)
//! - `coherence_bus_publish_rejected_total` - Counter of publishes refused (by reason)
//! - `coherence_bus_handler_failures_total` - Counter of handler errors and panics (by channel)
//! - `coherence_bus_transport_failures_total` - Counter of transport failures (by operation)
//! - `coherence_bus_operation_latency_seconds` - Histogram of publish/consume latency
//! - `coherence_bus_circuit_breaker_state` - Gauge of breaker state (0=Closed, 1=Open, 2=HalfOpen)

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter_vec, Gauge, HistogramVec,
    IntCounterVec,
};

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref MESSAGES_PUBLISHED: IntCounterVec = register_int_counter_vec!(
        "coherence_bus_messages_published_total",
        "Total number of messages appended to a channel",
        &["channel"]
    )
    .expect("Failed to create MESSAGES_PUBLISHED metric");

    pub static ref MESSAGES_CONSUMED: IntCounterVec = register_int_counter_vec!(
        "coherence_bus_messages_consumed_total",
        "Total number of messages delivered to subscribers",
        &["channel"]
    )
    .expect("Failed to create MESSAGES_CONSUMED metric");

    /// Publishes refused before reaching the transport, labeled by reason
    pub static ref PUBLISH_REJECTED: IntCounterVec = register_int_counter_vec!(
        "coherence_bus_publish_rejected_total",
        "Total number of publishes refused",
        &["reason"]
    )
    .expect("Failed to create PUBLISH_REJECTED metric");

    pub static ref HANDLER_FAILURES: IntCounterVec = register_int_counter_vec!(
        "coherence_bus_handler_failures_total",
        "Total number of subscriber handler errors and panics",
        &["channel"]
    )
    .expect("Failed to create HANDLER_FAILURES metric");

    pub static ref TRANSPORT_FAILURES: IntCounterVec = register_int_counter_vec!(
        "coherence_bus_transport_failures_total",
        "Total number of failed transport operations",
        &["operation"]
    )
    .expect("Failed to create TRANSPORT_FAILURES metric");

    pub static ref OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        "coherence_bus_operation_latency_seconds",
        "Latency of bus operations",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to create OPERATION_LATENCY metric");

    /// Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)
    pub static ref CIRCUIT_BREAKER_STATE: Gauge = register_gauge!(
        "coherence_bus_circuit_breaker_state",
        "Current circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)"
    )
    .expect("Failed to create CIRCUIT_BREAKER_STATE metric");
}

// =============================================================================
// METRIC RECORDING FUNCTIONS
// =============================================================================

#[cfg(feature = "metrics")]
pub fn record_published(channel: &str) {
    MESSAGES_PUBLISHED.with_label_values(&[channel]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_consumed(channel: &str) {
    MESSAGES_CONSUMED.with_label_values(&[channel]).inc();
}

/// Record a publish refused before the append, with reason
#[cfg(feature = "metrics")]
pub fn record_publish_rejected(reason: &str) {
    PUBLISH_REJECTED.with_label_values(&[reason]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_handler_failure(channel: &str) {
    HANDLER_FAILURES.with_label_values(&[channel]).inc();
}

/// Record a failed transport operation (`append`, `read`, `ack`, `ping`)
#[cfg(feature = "metrics")]
pub fn record_transport_failure(operation: &str) {
    TRANSPORT_FAILURES.with_label_values(&[operation]).inc();
}

#[cfg(feature = "metrics")]
pub fn observe_latency(operation: &str, seconds: f64) {
    OPERATION_LATENCY
        .with_label_values(&[operation])
        .observe(seconds);
}

/// Update circuit breaker state gauge
#[cfg(feature = "metrics")]
pub fn set_circuit_breaker_state(state: u8) {
    CIRCUIT_BREAKER_STATE.set(state as f64);
}

// =============================================================================
// NO-OP IMPLEMENTATIONS (when metrics feature disabled)
// =============================================================================

#[cfg(not(feature = "metrics"))]
pub fn record_published(_channel: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_consumed(_channel: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_publish_rejected(_reason: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_handler_failure(_channel: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_transport_failure(_operation: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn observe_latency(_operation: &str, _seconds: f64) {}

#[cfg(not(feature = "metrics"))]
pub fn set_circuit_breaker_state(_state: u8) {}
