use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors as the HTTP surface reports them:
/// `{"success": false, "error": {"code", "message", "details?"}}`.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Duplicate(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    RetrievalFailed(String),
    #[error("{0}")]
    Template(String),
    #[error("{0}")]
    Cancelled(String),
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Duplicate(_) => (StatusCode::CONFLICT, "duplicate_file"),
            Self::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_unavailable"),
            Self::RetrievalFailed(_) => (StatusCode::BAD_GATEWAY, "retrieval_failed"),
            Self::Template(_) => (StatusCode::INTERNAL_SERVER_ERROR, "template_error"),
            Self::Cancelled(_) => (StatusCode::REQUEST_TIMEOUT, "cancelled"),
            Self::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(message) => Self::BadRequest(message),
            AppError::Auth(message) => Self::Unauthorized(message),
            AppError::NotFound(message) => Self::NotFound(message),
            AppError::Duplicate(message) => Self::Duplicate(message),
            AppError::Upstream(message) => Self::Upstream(message),
            AppError::Retrieval(message) => Self::RetrievalFailed(message),
            AppError::TemplateParse(message) | AppError::TemplateExecute(message) => {
                Self::Template(message)
            }
            AppError::Cancelled(message) => Self::Cancelled(message),
            other => {
                tracing::error!(error = %other, "Internal error");
                Self::Internal
            }
        }
    }
}

impl From<surrealdb::Error> for ApiError {
    fn from(err: surrealdb::Error) -> Self {
        Self::from(AppError::Database(err))
    }
}

#[derive(Serialize, Debug)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    success: bool,
    error: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = ErrorResponse {
            success: false,
            error: ErrorBody {
                code,
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Success envelope used by the non-SSE endpoints.
#[derive(Serialize, Debug)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Value,
}

impl ApiResponse {
    pub fn data<T: Serialize>(value: T) -> Result<Json<ApiResponse>, ApiError> {
        let data = serde_json::to_value(value).map_err(|err| {
            tracing::error!(error = %err, "Failed to serialize response body");
            ApiError::Internal
        })?;
        Ok(Json(ApiResponse {
            success: true,
            data,
        }))
    }
}
