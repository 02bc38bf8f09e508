//! HTTP surface of the engine.
//!
//! - `GET /health` liveness
//! - `GET /metrics` Prometheus text
//! - `GET /v1/owners/:owner_id/live` WebSocket stream of the owner's task events
//! - `GET /v1/tasks/:task_id/audit` audit history with a consistency check
//! - `GET /v1/consumers` consumer counters
//! - `GET /v1/dead-letters` dead letters routed by this instance

mod handlers;
mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::audit::AuditLog;
use crate::bus::DeadLetterRouter;
use crate::consumer::ConsumerStats;
use crate::live_sync::LiveSyncBroadcaster;
use crate::telemetry::MetricsRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub live_sync: Arc<LiveSyncBroadcaster>,
    pub audit: Arc<AuditLog>,
    pub dead_letters: DeadLetterRouter,
    pub metrics: MetricsRegistry,
    /// Counters of the running consumers, by consumer name
    pub consumers: Arc<Vec<(String, ConsumerStats)>>,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/v1/owners/:owner_id/live", get(websocket::live_handler))
        .route("/v1/tasks/:task_id/audit", get(handlers::task_audit))
        .route("/v1/consumers", get(handlers::consumer_stats))
        .route("/v1/dead-letters", get(handlers::recent_dead_letters))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, InMemoryBus};
    use crate::clock::SystemClock;
    use crate::events::{OwnerId, TaskEvent, TaskId, TaskSnapshot};
    use crate::live_sync::LiveSyncConfig;
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use serde_json::Value;
    use tower::ServiceExt;

    fn state() -> AppState {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(2));
        AppState {
            live_sync: Arc::new(LiveSyncBroadcaster::new(&LiveSyncConfig::default())),
            audit: Arc::new(AuditLog::new(Arc::new(InMemoryStore::new()), Arc::new(SystemClock))),
            dead_letters: DeadLetterRouter::new(bus, RetryPolicy::no_retry(), 10),
            metrics: MetricsRegistry::disabled(),
            consumers: Arc::new(vec![("audit-log".to_string(), ConsumerStats::new())]),
        }
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

    #[test]
    fn test_api_response_error() {
        let response: ApiResponse<()> = ApiResponse::error("test error");
        assert!(!response.success);
        assert!(response.data.is_none());
        assert_eq!(response.error, Some("test error".to_string()));
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(build_router(state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_task_audit_returns_history() {
        let state = state();
        let task_id = TaskId::new();
        let event = TaskEvent::created(task_id, OwnerId::new("o"), Utc::now(), TaskSnapshot::new("Pay rent"));
        state.audit.append(&event).await.unwrap();

        let (status, body) = get_json(build_router(state), &format!("/v1/tasks/{}/audit", task_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["verification"]["entries"], 1);
        assert_eq!(body["data"]["entries"][0]["sequence_no"], 1);
        assert_eq!(body["data"]["entries"][0]["event_type"], "Created");
    }

    #[tokio::test]
    async fn test_task_audit_rejects_malformed_id() {
        let response = build_router(state())
            .oneshot(Request::builder().uri("/v1/tasks/not-a-uuid/audit").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_consumer_stats() {
        let (status, body) = get_json(build_router(state()), "/v1/consumers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["consumer"], "audit-log");
        assert_eq!(body["data"][0]["processed"], 0);
    }
}
