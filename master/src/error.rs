use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common::ErrorBody;

use crate::admission::AdmissionError;
use crate::catalog::CatalogError;
use crate::orchestrator::OrchestratorError;

/// Error de los handlers HTTP. Cada variante sabe su status y su código.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{reason}")]
    RateLimited { reason: String, count: u64 },

    #[error("Rate limiting is disabled")]
    AdmissionDisabled,

    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Validation(msg) => ApiError::Validation(msg),
            OrchestratorError::NotFound => ApiError::NotFound("Task not found".to_string()),
            OrchestratorError::Storage(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::DataFileNotFound | CatalogError::ScriptNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, count) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", None),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", None),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            ApiError::RateLimited { count, .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", Some(*count))
            }
            ApiError::AdmissionDisabled => {
                (StatusCode::SERVICE_UNAVAILABLE, "ADMISSION_DISABLED", None)
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "error interno");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
            }
        };

        let error = match &self {
            ApiError::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        };

        let body = ErrorBody {
            success: false,
            error,
            code: code.to_string(),
            count,
        };
        (status, Json(body)).into_response()
    }
}
