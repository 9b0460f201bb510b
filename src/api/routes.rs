//! Admin route definitions

use axum::{Router, routing::get};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;
use crate::grpc::pool::ConnectionPool;
use crate::grpc::transport::ChannelConnector;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ConnectionPool<ChannelConnector>>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the admin router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/pool", get(handlers::pool_stats))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
