use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Number of device slots.
    pub capacity: usize,
    /// Slots currently held by a job.
    pub active: usize,
}

/// GET /api/v1/health -- returns service health and slot usage.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        capacity: state.scheduler.capacity(),
        active: state.scheduler.active_count(),
    })
}

/// Mounted by [`super::api_routes`] next to `/jobs`.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
