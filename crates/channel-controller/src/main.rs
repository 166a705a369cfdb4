//! Channel Controller
//!
//! WebSocket control-plane server that arbitrates who holds each channel's
//! primary output slot.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (text or JSON)
//! 3. Initialize Prometheus metrics recorder
//! 4. Spawn the channel registry actor
//! 5. Bind the listener (fail fast) and serve `/ws`, `/health`, `/ready`, `/metrics`
//! 6. Wait for shutdown signal, drain, stop the registry

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::sync::Arc;

use channel_controller::actors::{ActorMetrics, ChannelRegistryHandle};
use channel_controller::config::{Config, LogFormat};
use channel_controller::observability::{init_metrics_recorder, HealthState};
use channel_controller::routes::{build_routes, AppState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Config first: the log format is part of it
    let config_result = Config::from_env();
    let log_format = config_result
        .as_ref()
        .map(|c| c.log_format)
        .unwrap_or_default();
    init_tracing(log_format);

    info!("Starting Channel Controller");

    let config = config_result.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        max_channels = config.max_channels,
        max_members_per_channel = config.max_members_per_channel,
        idle_timeout_seconds = config.idle_timeout.as_secs(),
        outbound_buffer = config.outbound_buffer,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let (registry, registry_task) = ChannelRegistryHandle::spawn(
        config.instance_id.clone(),
        config.max_channels,
        config.max_members_per_channel,
        CancellationToken::new(),
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    let shutdown_token = registry.child_token();
    let shutdown_grace = config.shutdown_grace;
    let bind_address = config.bind_address;

    let state = Arc::new(AppState {
        config,
        registry: registry.clone(),
        metrics: actor_metrics,
    });
    let app = build_routes(state, Arc::clone(&health_state), prometheus_handle);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %bind_address, "Failed to bind listener");
            format!("Failed to bind listener to {bind_address}: {e}")
        })?;
    info!(addr = %bind_address, "Listener bound successfully");

    let server_token = shutdown_token.child_token();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_token.cancelled().await;
            info!("HTTP server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server failed");
        }
    });

    health_state.set_ready();
    info!("Channel Controller running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop routing
    health_state.set_not_ready();

    // Stops new channels, cancels every channel and connection
    if let Err(e) = registry.shutdown(shutdown_grace).await {
        warn!(error = %e, "Actor system shutdown error");
    }
    shutdown_token.cancel();

    if tokio::time::timeout(shutdown_grace, server).await.is_err() {
        warn!("HTTP server did not stop within the grace period");
    }
    if tokio::time::timeout(shutdown_grace, registry_task).await.is_err() {
        warn!("Registry did not stop within the grace period");
    }

    info!("Channel Controller shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "channel_controller=debug,tower_http=debug".into());

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Wait for shutdown signal (SIGTERM or Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation failure is unrecoverable at startup"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation failure is unrecoverable at startup"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
