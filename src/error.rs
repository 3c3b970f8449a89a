use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the rate limiting engine.
///
/// Only `Validation`, `Security`, `BatchSizeExceeded`, `BatchDisabled` and
/// `Configuration` ever reach callers of the engine. Store and circuit
/// failures are absorbed into a safe-default result by the engine.
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Batch of {size} requests exceeds the maximum of {max}")]
    BatchSizeExceeded { size: usize, max: usize },

    #[error("Batch processing is disabled")]
    BatchDisabled,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, RateLimitError>;

impl RateLimitError {
    /// Whether this error should be converted into a safe-default decision
    /// instead of being returned to the caller.
    pub fn is_absorbable(&self) -> bool {
        matches!(
            self,
            RateLimitError::StoreUnavailable(_) | RateLimitError::CircuitOpen
        )
    }
}

impl From<StoreError> for RateLimitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => RateLimitError::StoreUnavailable(msg),
            StoreError::UnknownProcedure(handle) => RateLimitError::Security(format!(
                "procedure handle {} is not registered with the store",
                handle
            )),
            StoreError::Malformed(msg) => RateLimitError::Security(msg),
            StoreError::Script(msg) => RateLimitError::Security(format!("procedure failed: {}", msg)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &RateLimitError) -> Self {
        let message = err.to_string();
        match err {
            RateLimitError::Validation(_) => Self::new("validation_error", &message, 422),
            RateLimitError::Security(_) => Self::new("security_error", &message, 500),
            RateLimitError::StoreUnavailable(_) => Self::new("service_unavailable", &message, 503),
            RateLimitError::CircuitOpen => Self::new("service_unavailable", &message, 503),
            RateLimitError::BatchSizeExceeded { .. } => {
                Self::new("batch_too_large", &message, 413)
            }
            RateLimitError::BatchDisabled => Self::new("batch_disabled", &message, 503),
            RateLimitError::Configuration(_) => Self::new("configuration_error", &message, 500),
        }
    }
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
