use axum::{routing::get, Router};

pub mod jobs;
pub mod system;

/// Router for all API endpoints; expects `Extension<Arc<AppServices>>`.
pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(system::health))
        .nest("/ingest/jobs", jobs::router())
}
