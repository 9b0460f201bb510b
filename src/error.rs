//! Error types for the relay, the connection pool and the admin API

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;
use tonic::Status;

/// Outcome of a single receive or send on a relayed stream.
///
/// `Eof` is the clean-termination sentinel: the peer finished its direction of
/// the stream. Everything else is a real failure carrying a gRPC status.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("end of stream")]
    Eof,
    #[error(transparent)]
    Status(#[from] Status),
}

impl RelayError {
    pub fn is_eof(&self) -> bool {
        matches!(self, RelayError::Eof)
    }

    /// Terminal status for a stream that ended where a frame was required
    pub fn into_status(self, unexpected_eof: &str) -> Status {
        match self {
            RelayError::Eof => Status::internal(unexpected_eof.to_string()),
            RelayError::Status(status) => status,
        }
    }
}

/// Backend connection pool errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool is closed")]
    Closed,
    #[error("connection pool exhausted ({max_active} active connections)")]
    Exhausted { max_active: usize },
    #[error("failed to dial backend: {0}")]
    Dial(String),
    #[error("dialing backend timed out after {0:?}")]
    DialTimeout(Duration),
}

impl From<PoolError> for Status {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { .. } => Status::resource_exhausted(err.to_string()),
            PoolError::Closed | PoolError::Dial(_) | PoolError::DialTimeout(_) => {
                Status::unavailable(err.to_string())
            }
        }
    }
}

/// Admin API error types
#[derive(Debug)]
pub enum ApiError {
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
