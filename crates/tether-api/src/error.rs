//! HTTP error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

/// Handler error, rendered as `{"error": "..."}` with a matching status.
#[derive(Debug)]
pub enum ApiError {
    Internal(tether_core::Error),
    NotFound(String),
    BadRequest(String),
    /// A detection job is already active for the document.
    Conflict {
        message: String,
        active_job_id: Option<Uuid>,
    },
}

impl From<tether_core::Error> for ApiError {
    fn from(err: tether_core::Error) -> Self {
        if err.is_not_found() {
            return ApiError::NotFound(err.to_string());
        }
        if let tether_core::Error::AlreadyInProgress { job_id, .. } = &err {
            return ApiError::Conflict {
                active_job_id: *job_id,
                message: err.to_string(),
            };
        }
        match err {
            tether_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Internal(err) => {
                tracing::error!(subsystem = "api", error = %err, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": err.to_string() }),
                )
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
            }
            ApiError::Conflict {
                message,
                active_job_id,
            } => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": message, "active_job_id": active_job_id }),
            ),
        };

        (status, Json(body)).into_response()
    }
}
