//! HTTP server for health and metrics endpoints
//!
//! - `GET /health`  - per-lane status (JSON)
//! - `GET /metrics` - Prometheus metrics

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

/// Status of one lane as last reported by its task
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaneHealth {
    pub state: String,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    pub cycles: u64,
    pub messages_dispatched: u64,
    pub last_error: Option<String>,
}

/// Lane statuses shared between the manager and the HTTP server
pub type SharedHealth = Arc<RwLock<BTreeMap<String, LaneHealth>>>;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub lanes: BTreeMap<String, LaneHealth>,
}

/// `degraded` while any lane has its circuit breaker open
async fn health_check(State(health): State<SharedHealth>) -> Json<HealthResponse> {
    let lanes = health.read().await.clone();
    let status = if lanes.values().any(|lane| lane.circuit_open) {
        "degraded"
    } else {
        "healthy"
    };
    Json(HealthResponse { status, lanes })
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(health: SharedHealth) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .with_state(health)
}

/// Serve health and metrics on `port`
pub async fn start_api_server(port: u16, health: SharedHealth) -> eyre::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");

    crate::metrics::UP.set(1.0);
    axum::serve(listener, router(health)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_degraded_when_circuit_open() {
        let health: SharedHealth = Arc::default();
        health.write().await.insert(
            "a-b".to_string(),
            LaneHealth {
                state: "idle".to_string(),
                ..Default::default()
            },
        );

        let Json(response) = health_check(State(health.clone())).await;
        assert_eq!(response.status, "healthy");

        health
            .write()
            .await
            .entry("a-b".to_string())
            .or_default()
            .circuit_open = true;
        let Json(response) = health_check(State(health)).await;
        assert_eq!(response.status, "degraded");
        assert!(response.lanes["a-b"].circuit_open);
    }

    #[tokio::test]
    async fn test_health_json_shape() {
        let health: SharedHealth = Arc::default();
        health.write().await.insert(
            "a-b".to_string(),
            LaneHealth {
                state: "confirming".to_string(),
                consecutive_failures: 3,
                last_error: Some("transport failure: timeout".to_string()),
                ..Default::default()
            },
        );

        let Json(response) = health_check(State(health)).await;
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["lanes"]["a-b"]["state"], "confirming");
        assert_eq!(body["lanes"]["a-b"]["consecutive_failures"], 3);
        assert_eq!(
            body["lanes"]["a-b"]["last_error"],
            "transport failure: timeout"
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text_format() {
        crate::metrics::record_cycle("api-test", true);
        let response = prometheus_metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
