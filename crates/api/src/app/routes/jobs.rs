use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use reporter_core::JobId;
use reporter_infra::config::DEFAULT_LIST_LIMIT;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs).post(submit_job))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job))
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    let resource_ref = body.resource_ref;
    match services.call(move |c| c.submit_job(resource_ref)).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(dto::SubmitJobResponse {
                job_id: job.id,
                status: job.status,
            }),
        )
            .into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services.call(move |c| c.get_status(id)).await {
        Ok(job) => Json(dto::JobResponse::from(job)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match services.call(move |c| c.list(limit)).await {
        Ok(jobs) => Json(dto::JobListResponse::from(jobs)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.call(|c| c.stats()).await {
        Ok(stats) => Json(dto::JobStatsResponse::from(stats)).into_response(),
        Err(e) => errors::coordinator_error_to_response(e),
    }
}
