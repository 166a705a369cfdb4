//! HTTP routes for the Channel Controller.
//!
//! Defines the Axum router and application state.

use crate::actors::{ActorMetrics, ChannelRegistryHandle};
use crate::config::Config;
use crate::observability::{health_router, HealthState};
use crate::transport::ws_handler;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared by the WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// Channel registry actor.
    pub registry: ChannelRegistryHandle,

    /// Shared actor counters.
    pub metrics: Arc<ActorMetrics>,
}

/// Build the application routes.
///
/// - `/ws` - control protocol (WebSocket upgrade)
/// - `/health` - liveness probe
/// - `/ready` - readiness probe, false while starting or draining
/// - `/metrics` - Prometheus text
pub fn build_routes(
    state: Arc<AppState>,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let registry = state.registry.clone();
    let ws_routes = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    ws_routes
        .merge(health_router(health_state, registry))
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
