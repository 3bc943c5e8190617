use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use auditq_core::PipelineError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound(msg) => Self::not_found(msg),
            PipelineError::InvalidInput(msg) => Self::bad_request(msg),
            PipelineError::LeaseMismatch { .. }
            | PipelineError::LeaseExpired { .. }
            | PipelineError::DuplicateIdempotencyKey { .. } => {
                Self::conflict(err.to_string())
            }
            PipelineError::Database(err) => {
                tracing::error!(error = ?err, "database operation failed");
                Self::internal("Database operation failed")
            }
            PipelineError::Broker(err) => {
                tracing::error!(error = ?err, "broker operation failed");
                Self::internal("Queue broker unavailable")
            }
            other => {
                tracing::error!(error = %other, "request failed");
                Self::internal(other.to_string())
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditq_core::JobId;

    #[test]
    fn pipeline_errors_map_to_http_statuses() {
        let cases = [
            (PipelineError::NotFound("job".into()), StatusCode::NOT_FOUND),
            (
                PipelineError::InvalidInput("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                PipelineError::LeaseMismatch { job_id: JobId::new() },
                StatusCode::CONFLICT,
            ),
            (
                PipelineError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
