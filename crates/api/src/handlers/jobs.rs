//! Handlers for the `/jobs` resource.
//!
//! Every handler is a thin adapter over [`JobScheduler`] or one of the
//! polling services; none of them holds scheduler state across awaits.
//!
//! [`JobScheduler`]: trainyard_engine::JobScheduler

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use trainyard_core::error::CoreError;
use trainyard_core::job_spec::SubmitJob;
use trainyard_core::types::JobId;
use trainyard_engine::{LastKnown, PollOutcome};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SubmittedJob {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct WeightProgress {
    pub progress: u8,
}

// ---------------------------------------------------------------------------
// Submit / list / get
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Validate and enqueue a training or prediction job. Returns 201 with the
/// job ID; the job is `reserved` until a device slot frees up.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<SubmitJob>,
) -> AppResult<impl IntoResponse> {
    let kind = input.kind();
    let job_id = state.scheduler.submit(input).await?;

    tracing::info!(job_id = %job_id, kind = %kind, "Job accepted over HTTP");

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: SubmittedJob { job_id },
        }),
    ))
}

/// GET /api/v1/jobs
pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(DataResponse {
        data: state.scheduler.summary(),
    })
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let observation = state.scheduler.observe(job_id)?;
    Ok(Json(DataResponse { data: observation }))
}

// ---------------------------------------------------------------------------
// Stop / delete
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/stop
///
/// Returns 204 once the job's worker has exited, or 504 if it does not
/// acknowledge cancellation within the stop timeout.
pub async fn stop_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<StatusCode> {
    state.scheduler.stop(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/v1/jobs/{id}
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<StatusCode> {
    state.scheduler.delete(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}/progress?last_epoch&last_batch&running_state&state
///
/// Long-poll. 200 with a status report as soon as something newer than the
/// client's last view is observable, 204 when the poll window elapses.
pub async fn job_progress(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    Query(last): Query<LastKnown>,
) -> AppResult<Response> {
    match state.long_poll.wait_for_update(job_id, &last).await? {
        PollOutcome::Update(report) => Ok(Json(DataResponse { data: report }).into_response()),
        PollOutcome::Timeout => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// GET /api/v1/jobs/{id}/weight/progress/{threshold}
///
/// 200 with the download percentage once it exceeds `threshold` (or the
/// weight is available), 204 when the poll window elapses.
pub async fn weight_progress(
    State(state): State<AppState>,
    Path((job_id, threshold)): Path<(JobId, u8)>,
) -> AppResult<Response> {
    if threshold > 100 {
        return Err(AppError::BadRequest(format!(
            "threshold must be between 0 and 100, got {threshold}"
        )));
    }
    match state.weight_progress.poll(job_id, threshold).await? {
        Some(progress) => Ok(Json(DataResponse {
            data: WeightProgress { progress },
        })
        .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}/prediction
///
/// Detections of a completed prediction job; 409 while none are available.
pub async fn prediction_result(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let result = finished_prediction(&state, job_id)?;
    Ok(Json(DataResponse { data: result }))
}

/// GET /api/v1/jobs/{id}/prediction.csv
///
/// The same detections as a CSV download, one row per detection.
pub async fn prediction_csv(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let result = finished_prediction(&state, job_id)?;
    let body = result
        .to_csv()
        .map_err(|e| AppError::Core(CoreError::Internal(format!("CSV export failed: {e}"))))?;

    tracing::debug!(job_id = %job_id, rows = result.detection_count(), "Prediction exported");

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"prediction-{job_id}.csv\""),
            ),
        ],
        body,
    ))
}

fn finished_prediction(
    state: &AppState,
    job_id: JobId,
) -> AppResult<std::sync::Arc<trainyard_core::detection::PredictionResult>> {
    state.scheduler.prediction_result(job_id)?.ok_or_else(|| {
        AppError::Core(CoreError::Conflict(format!(
            "Job {job_id} has no prediction result"
        )))
    })
}
