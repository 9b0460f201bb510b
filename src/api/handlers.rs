//! Admin request handlers

use axum::{Json, extract::State, http::StatusCode};

use super::models::{HealthResponse, PoolResponse};
use super::routes::AppState;
use crate::error::ApiError;

/// GET /health - healthy while the backend pool accepts calls
pub async fn health(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<HealthResponse>), ApiError> {
    if state.pool.is_closed() {
        return Err(ApiError::Unavailable(
            "Backend connection pool is closed".to_string(),
        ));
    }

    Ok((
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    ))
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    crate::metrics::update_pool_stats(&state.pool.stats());
    state.prometheus_handle.render()
}

/// GET /pool - Connection pool accounting
pub async fn pool_stats(State(state): State<AppState>) -> Json<PoolResponse> {
    let stats = state.pool.stats();
    crate::metrics::update_pool_stats(&stats);

    let config = state.pool.config();
    Json(PoolResponse {
        backend: state.pool.connector().backend().to_string(),
        max_active: config.max_active,
        max_idle: config.max_idle,
        closed: state.pool.is_closed(),
        stats,
    })
}
