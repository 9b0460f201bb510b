//! Admin API tests run in-process with axum-test

use axum_test::TestServer;
use grpc_relay::{
    ChannelConnector, ConnectionPool, ProxyConfig,
    api::routes::{AppState, create_router},
    metrics,
};
use std::sync::{Arc, OnceLock};

// Global metrics handle - only initialize once per test process
static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

/// Admin server over a pool that has not dialed anything yet
fn create_test_server() -> (TestServer, Arc<ConnectionPool<ChannelConnector>>) {
    let mut config = ProxyConfig::default();
    config.backend.address = "config-backend.internal:9090".to_string();
    config.pool.max_active = 3;
    config.pool.max_idle = 1;

    let connector = ChannelConnector::new(&config).expect("Failed to build connector");
    let pool = Arc::new(ConnectionPool::new(connector, config.pool.clone()));

    let state = AppState {
        pool: pool.clone(),
        prometheus_handle: get_metrics_handle(),
    };
    let server = TestServer::new(create_router(state));

    (server, pool)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _pool) = create_test_server();

    let response = server.get("/health").await;

    assert_eq!(response.status_code(), 200);

    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_health_unavailable_after_pool_shutdown() {
    let (server, pool) = create_test_server();
    pool.shutdown().unwrap();

    let response = server.get("/health").await;

    assert_eq!(response.status_code(), 503);
    let body: serde_json::Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("closed"));
}

#[tokio::test]
async fn test_pool_endpoint() {
    let (server, _pool) = create_test_server();

    let response = server.get("/pool").await;

    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert!(
        body["backend"]
            .as_str()
            .unwrap()
            .starts_with("http://config-backend.internal:9090")
    );
    assert_eq!(body["max_active"], 3);
    assert_eq!(body["max_idle"], 1);
    assert_eq!(body["closed"], false);
    assert_eq!(body["connections"], 0);
    assert_eq!(body["active_streams"], 0);
    assert_eq!(body["dialing"], 0);
}

#[tokio::test]
async fn test_pool_endpoint_reports_closed() {
    let (server, pool) = create_test_server();
    pool.shutdown().unwrap();

    let body: serde_json::Value = server.get("/pool").await.json();
    assert_eq!(body["closed"], true);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (server, _pool) = create_test_server();

    let response = server.get("/metrics").await;

    assert_eq!(response.status_code(), 200);
    // Pool gauges are refreshed on every scrape
    assert!(response.text().contains("grpc_relay_pool_connections"));
}

#[tokio::test]
async fn test_unknown_route() {
    let (server, _pool) = create_test_server();

    let response = server.get("/instances").expect_failure().await;

    assert_eq!(response.status_code(), 404);
}
