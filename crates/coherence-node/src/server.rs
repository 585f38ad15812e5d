//! HTTP surface for health checks and scraping.
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /health` | health report, 200 when healthy, 503 otherwise |
//! | `GET /metrics` | JSON performance snapshot |
//! | `GET /metrics/prometheus` | Prometheus text exposition |

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use coherence_bus::CoherenceBus;
use tracing::error;

/// Build the router over a shared bus.
pub fn build_router(bus: Arc<CoherenceBus>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(performance_metrics))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .with_state(bus)
}

async fn health_check(State(bus): State<Arc<CoherenceBus>>) -> Response {
    let report = bus.health_check().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn performance_metrics(State(bus): State<Arc<CoherenceBus>>) -> Response {
    Json(bus.performance_metrics()).into_response()
}

async fn prometheus_metrics() -> Response {
    match coherence_telemetry::encode_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, coherence_telemetry::metrics_content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use coherence_bus::{
        BusConfig, CircuitState, FragmentUpdate, InMemoryStreamTransport, Payload,
        FRAGMENT_UPDATES,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    fn bus() -> Arc<CoherenceBus> {
        Arc::new(CoherenceBus::with_standard_channels(
            BusConfig::default(),
            Arc::new(InMemoryStreamTransport::new()),
        ))
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_ok_when_connected() {
        let bus = bus();
        bus.connect().await.unwrap();

        let (status, body) = get_json(build_router(bus), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["transport_connected"], true);
        assert_eq!(body["circuit_breaker_state"], "CLOSED");
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_health_unavailable_when_disconnected() {
        let (status, body) = get_json(build_router(bus()), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["healthy"], false);
        assert_eq!(body["transport_connected"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_metrics_snapshot_counts_publishes() {
        let bus = bus();
        bus.connect().await.unwrap();
        let fragment = FragmentUpdate {
            fragment_id: "frag-1".to_string(),
            content: "Prefer primary sources.".to_string(),
            priority: 0.5,
            context_domain: "research".to_string(),
            validation_score: None,
            usage_count: 0,
            success_rate: 0.0,
            last_updated: String::new(),
        };
        bus.publish(FRAGMENT_UPDATES, Payload::FragmentUpdate(fragment), "fragment_manager", 0)
            .await
            .unwrap();

        let (status, body) = get_json(build_router(bus.clone()), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages_sent"], 1);
        assert_eq!(body["throughput_target"], 10_000);
        assert_eq!(bus.circuit_breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_prometheus_text_exposition() {
        let response = build_router(bus())
            .oneshot(
                Request::builder()
                    .uri("/metrics/prometheus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }
}
