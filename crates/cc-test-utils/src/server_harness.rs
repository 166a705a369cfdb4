//! Test server harness for E2E testing
//!
//! Provides `TestChannelServer` for spawning real Channel Controller
//! instances in tests.

use channel_client::{ClientOptions, ControlClient};
use channel_controller::actors::{ActorMetrics, ChannelRegistryHandle};
use channel_controller::config::Config;
use channel_controller::observability::HealthState;
use channel_controller::routes::{self, AppState};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Test harness for spawning the Channel Controller in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_join_flow() -> Result<()> {
///     let server = TestChannelServer::spawn().await?;
///     let mut client = server.connect().await?;
///     let joined = client.join(&ChannelId::new("demo"), &ParticipantId::new("a")).await?;
///     assert_eq!(joined.holder, None);
///     Ok(())
/// }
/// ```
pub struct TestChannelServer {
    addr: SocketAddr,
    config: Config,
    registry: ChannelRegistryHandle,
    health: Arc<HealthState>,
    metrics: Arc<ActorMetrics>,
    _handle: JoinHandle<()>,
}

impl TestChannelServer {
    /// Spawn a server with test defaults.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background, marked ready
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(HashMap::new()).await
    }

    /// Spawn a server with extra `CC_*` variables layered over the test
    /// defaults.
    pub async fn spawn_with(overrides: HashMap<String, String>) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([
            ("CC_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("CC_INSTANCE_ID".to_string(), "cc-test".to_string()),
            ("CC_SHUTDOWN_GRACE_SECONDS".to_string(), "1".to_string()),
        ]);
        vars.extend(overrides);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        // Non-global recorder so parallel tests don't fight over installation
        let prometheus_handle = PrometheusBuilder::new().build_recorder().handle();

        let metrics = ActorMetrics::new();
        let (registry, _registry_task) = ChannelRegistryHandle::spawn(
            config.instance_id.clone(),
            config.max_channels,
            config.max_members_per_channel,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );

        let health = Arc::new(HealthState::new());
        let state = Arc::new(AppState {
            config: config.clone(),
            registry: registry.clone(),
            metrics: Arc::clone(&metrics),
        });
        let app = routes::build_routes(state, Arc::clone(&health), prometheus_handle);

        let listener = tokio::net::TcpListener::bind(config.bind_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        health.set_ready();

        Ok(Self {
            addr,
            config,
            registry,
            health,
            metrics,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the control-plane WebSocket URL.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the registry handle, for status and shutdown assertions.
    pub fn registry(&self) -> &ChannelRegistryHandle {
        &self.registry
    }

    /// Get the readiness state.
    pub fn health(&self) -> &HealthState {
        &self.health
    }

    /// Get the shared actor counters.
    pub fn metrics(&self) -> &ActorMetrics {
        &self.metrics
    }

    /// Open a control connection without a heartbeat.
    pub async fn connect(&self) -> Result<ControlClient, anyhow::Error> {
        let options = ClientOptions {
            ping_interval: None,
            ..ClientOptions::default()
        };
        ControlClient::connect_with(&self.ws_url(), options)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect control client: {}", e))
    }
}

impl Drop for TestChannelServer {
    fn drop(&mut self) {
        self.registry.cancel();
        self._handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{ChannelId, ParticipantId};

    #[tokio::test]
    async fn test_server_spawns_successfully() -> Result<(), anyhow::Error> {
        let server = TestChannelServer::spawn().await?;

        assert!(server.url().starts_with("http://127.0.0.1:"));

        let response = reqwest::get(format!("{}/health", server.url())).await?;
        assert_eq!(response.status(), 200);

        let response = reqwest::get(format!("{}/ready", server.url())).await?;
        assert_eq!(response.status(), 200);

        Ok(())
    }

    #[tokio::test]
    async fn test_server_provides_addr() -> Result<(), anyhow::Error> {
        let server = TestChannelServer::spawn().await?;

        let addr = server.addr();
        assert!(addr.ip().is_loopback());
        assert!(addr.port() > 0);
        assert_eq!(server.url(), format!("http://{addr}"));
        assert_eq!(server.ws_url(), format!("ws://{addr}/ws"));

        Ok(())
    }

    #[tokio::test]
    async fn test_overrides_reach_config() -> Result<(), anyhow::Error> {
        let server = TestChannelServer::spawn_with(HashMap::from([(
            "CC_MAX_MEMBERS_PER_CHANNEL".to_string(),
            "3".to_string(),
        )]))
        .await?;

        assert_eq!(server.config().max_members_per_channel, 3);
        assert_eq!(server.config().instance_id, "cc-test");
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_and_join() -> Result<(), anyhow::Error> {
        let server = TestChannelServer::spawn().await?;
        let mut client = server.connect().await?;

        let joined = client
            .join(&ChannelId::new("harness"), &ParticipantId::new("a"))
            .await?;
        assert_eq!(joined.identity.as_str(), "a");
        assert_eq!(joined.holder, None);

        let status = server.registry().get_status().await?;
        assert_eq!(status.channel_count, 1);
        Ok(())
    }
}
