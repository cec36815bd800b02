use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::db::store::StoreError;
use crate::services::activation::ActivationError;
use crate::services::ads_api::{ApiError, ErrorKind};
use crate::services::audit::AuditError;
use crate::services::processor::JobError;

pub mod health;
pub mod jobs;
pub mod maintenance;
pub mod metrics;

/// Error body returned by every handler.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            StoreError::Database(_) | StoreError::Corrupt(_) => {
                tracing::error!(error = %err, "Job store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<ApiError> for AppError {
    fn from(err: ApiError) -> Self {
        let status = match err.kind {
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Rejected | ErrorKind::RequestTooLarge => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Transient | ErrorKind::Fatal => StatusCode::BAD_GATEWAY,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Store(err) => err.into(),
        }
    }
}

impl From<AuditError> for AppError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::Api(err) => err.into(),
            AuditError::Store(err) => err.into(),
            AuditError::UnknownVariant(_) => AppError::new(StatusCode::BAD_REQUEST, err.to_string()),
        }
    }
}

impl From<ActivationError> for AppError {
    fn from(err: ActivationError) -> Self {
        match err {
            ActivationError::Api(err) => err.into(),
            ActivationError::UnknownVariant(_) => AppError::new(StatusCode::BAD_REQUEST, err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, AppError>;
