//! Route definitions for the `/jobs` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;

/// Routes mounted at `/jobs`.
///
/// ```text
/// GET    /                                  -> list_jobs
/// POST   /                                  -> submit_job
/// GET    /{id}                              -> get_job
/// DELETE /{id}                              -> delete_job
/// POST   /{id}/stop                         -> stop_job
/// GET    /{id}/progress                     -> job_progress
/// GET    /{id}/weight/progress/{threshold}  -> weight_progress
/// GET    /{id}/prediction                   -> prediction_result
/// GET    /{id}/prediction.csv               -> prediction_csv
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/{id}/stop", post(jobs::stop_job))
        .route("/{id}/progress", get(jobs::job_progress))
        .route(
            "/{id}/weight/progress/{threshold}",
            get(jobs::weight_progress),
        )
        .route("/{id}/prediction", get(jobs::prediction_result))
        .route("/{id}/prediction.csv", get(jobs::prediction_csv))
}
