use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use jobs_core::{CorrelationId, JobError};

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Map a domain error to a response. Infrastructure failures are logged and
/// answered with the correlation id only.
pub fn job_error_to_response(err: JobError, correlation_id: &CorrelationId) -> axum::response::Response {
    match err {
        JobError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        JobError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        JobError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        err @ JobError::NotCancellable { .. } => {
            json_error(StatusCode::BAD_REQUEST, "not_cancellable", err.to_string())
        }
        err @ JobError::NotCompleted { .. } => {
            json_error(StatusCode::BAD_REQUEST, "not_completed", err.to_string())
        }
        JobError::Store(_) | JobError::Queue(_) | JobError::Storage(_) => {
            tracing::error!(error = %err, correlation_id = %correlation_id, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({
                    "error": "internal_error",
                    "message": "internal error",
                    "trace_id": correlation_id.as_str(),
                })),
            )
                .into_response()
        }
    }
}
