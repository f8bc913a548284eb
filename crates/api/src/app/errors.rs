use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use reporter_core::JobStatus;
use reporter_infra::jobs::CoordinatorError;

pub fn coordinator_error_to_response(err: CoordinatorError) -> axum::response::Response {
    match err {
        CoordinatorError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        CoordinatorError::Conflict { .. } => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        CoordinatorError::Transient(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg)
        }
        CoordinatorError::EnqueueFailed { id, ref reason } => {
            tracing::warn!(job_id = %id, reason = %reason, "submission rolled back");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({
                    "error": "enqueue_failed",
                    "message": err.to_string(),
                    "job_id": id,
                    "status": JobStatus::Failed,
                })),
            )
                .into_response()
        }
        CoordinatorError::Integrity(msg) => {
            tracing::error!(error = %msg, "integrity violation");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "integrity_error", msg)
        }
        CoordinatorError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg)
        }
    }
}

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

#[cfg(test)]
mod tests {
    use reporter_core::JobId;

    use super::*;

    #[test]
    fn status_codes_follow_error_class() {
        let id = JobId::new();
        let cases = [
            (CoordinatorError::NotFound(id), StatusCode::NOT_FOUND),
            (
                CoordinatorError::Conflict {
                    id,
                    expected: JobStatus::Queued,
                    actual: JobStatus::Succeeded,
                },
                StatusCode::CONFLICT,
            ),
            (CoordinatorError::Transient("pool".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                CoordinatorError::EnqueueFailed {
                    id,
                    reason: "down".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (CoordinatorError::Integrity("dup".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (CoordinatorError::Storage("sql".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(coordinator_error_to_response(err).status(), expected);
        }
    }
}
