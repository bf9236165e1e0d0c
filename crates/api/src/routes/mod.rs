pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /jobs                                         list, submit
/// /jobs/{id}                                    observe, delete
/// /jobs/{id}/stop                               stop
/// /jobs/{id}/progress                           long-poll status report
/// /jobs/{id}/weight/progress/{threshold}        weight download progress
/// /jobs/{id}/prediction                         prediction result
/// /jobs/{id}/prediction.csv                     prediction result as CSV
/// /health                                       liveness and slot usage
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/jobs", jobs::router())
}
