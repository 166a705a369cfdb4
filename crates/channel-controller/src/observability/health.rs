//! Health endpoints for the Channel Controller.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (are joins being accepted?)
//!
//! Readiness combines the startup flag raised by `main` with the registry's
//! own view: a registry that is draining, cancelled or too busy to answer
//! within [`READINESS_STATUS_TIMEOUT`] reports not ready. The body carries
//! the registry counts for operators.

use crate::actors::ChannelRegistryHandle;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How long `/ready` waits for the registry status.
pub const READINESS_STATUS_TIMEOUT: Duration = Duration::from_millis(500);

/// Liveness and readiness flags.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    /// Raised once the listener is bound; dropped when shutdown begins.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, not yet ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ProbeState {
    health: Arc<HealthState>,
    registry: ChannelRegistryHandle,
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>, registry: ChannelRegistryHandle) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(ProbeState {
            health: health_state,
            registry,
        })
}

async fn liveness_handler(State(state): State<ProbeState>) -> StatusCode {
    if state.health.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<ProbeState>) -> (StatusCode, Json<Value>) {
    let not_ready = |reason: &str| {
        debug!(target: "cc.health", reason = reason, "Readiness check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "reason": reason })),
        )
    };

    if !state.health.is_ready() {
        return not_ready("starting_or_stopping");
    }
    if state.registry.is_cancelled() {
        return not_ready("registry_stopped");
    }

    match tokio::time::timeout(READINESS_STATUS_TIMEOUT, state.registry.get_status()).await {
        Ok(Ok(status)) if status.is_draining => not_ready("draining"),
        Ok(Ok(status)) => (
            StatusCode::OK,
            Json(json!({
                "ready": true,
                "channels": status.channel_count,
                "connections": status.connection_count,
            })),
        ),
        Ok(Err(_)) => not_ready("registry_stopped"),
        Err(_) => not_ready("registry_busy"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::ActorMetrics;
    use axum::body::Body;
    use axum::http::Request;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    fn spawn_registry() -> ChannelRegistryHandle {
        let (registry, _task) = ChannelRegistryHandle::spawn(
            "cc-health-test".to_string(),
            4,
            4,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        registry
    }

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");

        app.oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[test]
    fn test_health_state_transitions() {
        let state = HealthState::new();
        assert!(state.is_live());
        assert!(!state.is_ready());

        state.set_ready();
        assert!(state.is_ready());

        state.set_not_ready();
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_liveness_ignores_registry() {
        let registry = spawn_registry();
        registry.cancel();
        let app = health_router(Arc::new(HealthState::new()), registry);
        assert_eq!(status_of(app, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_needs_flag_and_running_registry() {
        let state = Arc::new(HealthState::new());
        let registry = spawn_registry();

        let app = health_router(Arc::clone(&state), registry.clone());
        assert_eq!(
            status_of(app, "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE,
            "/ready should return 503 before startup completes"
        );

        state.set_ready();
        let app = health_router(Arc::clone(&state), registry.clone());
        assert_eq!(status_of(app, "/ready").await, StatusCode::OK);

        registry.shutdown(Duration::from_millis(10)).await.unwrap();
        let app = health_router(Arc::clone(&state), registry);
        assert_eq!(
            status_of(app, "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE,
            "a drained registry is not ready even with the flag raised"
        );
    }

    #[tokio::test]
    async fn test_readiness_body_reports_counts() {
        let state = Arc::new(HealthState::new());
        state.set_ready();
        let registry = spawn_registry();
        registry
            .get_or_create(common::types::ChannelId::new("demo"))
            .await
            .unwrap();

        let app = health_router(state, registry.clone());
        let response = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["ready"], true);
        assert_eq!(body["channels"], 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_health_router_unknown_path_returns_404() {
        let app = health_router(Arc::new(HealthState::new()), spawn_registry());
        assert_eq!(status_of(app, "/unknown").await, StatusCode::NOT_FOUND);
    }
}
