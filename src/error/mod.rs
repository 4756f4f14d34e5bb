use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for rate limiting operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Error types.
///
/// Admission denial is not an error: it is reported through
/// [`RateLimitResult`](crate::rate_limit::RateLimitResult).
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown rate limit strategy: {0}")]
    InvalidStrategy(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RateLimitError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RateLimitError::InvalidStrategy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RateLimitError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RateLimitError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
