//! Admin API response models

use serde::{Deserialize, Serialize};

use crate::grpc::pool::PoolStats;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Backend pool snapshot
#[derive(Debug, Serialize)]
pub struct PoolResponse {
    pub backend: String,
    pub max_active: usize,
    pub max_idle: usize,
    pub closed: bool,
    #[serde(flatten)]
    pub stats: PoolStats,
}
