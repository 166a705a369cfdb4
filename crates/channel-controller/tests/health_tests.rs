//! Health and metrics endpoint integration tests.
//!
//! Tests the HTTP surface using the `TestChannelServer` harness.

use cc_test_utils::TestChannelServer;
use std::time::Duration;

/// Test that liveness and readiness return 200 on a running server.
#[tokio::test]
async fn test_health_and_ready_return_200() -> Result<(), anyhow::Error> {
    let server = TestChannelServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let response = client.get(format!("{}/ready", server.url())).send().await?;
    assert_eq!(response.status(), 200);

    Ok(())
}

/// Test that readiness flips to 503 once the server starts draining.
#[tokio::test]
async fn test_ready_returns_503_while_draining() -> Result<(), anyhow::Error> {
    let server = TestChannelServer::spawn().await?;
    let client = reqwest::Client::new();

    server.health().set_not_ready();

    let response = client.get(format!("{}/ready", server.url())).send().await?;
    assert_eq!(response.status(), 503);

    // Liveness is unaffected
    let response = client
        .get(format!("{}/health", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    Ok(())
}

/// Test that the metrics endpoint serves Prometheus text.
#[tokio::test]
async fn test_metrics_endpoint_returns_200() -> Result<(), anyhow::Error> {
    let server = TestChannelServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/metrics", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    Ok(())
}

/// Test that a plain GET on the WebSocket route without upgrade headers is refused.
#[tokio::test]
async fn test_ws_route_requires_upgrade() -> Result<(), anyhow::Error> {
    let server = TestChannelServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/ws", server.url()))
        .timeout(Duration::from_secs(5))
        .send()
        .await?;
    assert!(response.status().is_client_error());

    Ok(())
}

/// Test that non-existent routes return 404.
#[tokio::test]
async fn test_unknown_route_returns_404() -> Result<(), anyhow::Error> {
    let server = TestChannelServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/v1/nonexistent", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    Ok(())
}
