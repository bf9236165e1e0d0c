//! Worker execution for one job on one device slot.
//!
//! The worker owns the batch/epoch loop. It checks the job's cancellation
//! flag before every batch, publishes progress as whole snapshots and
//! reports how it ended through [`WorkerOutcome`]. It never touches the
//! lifecycle state; the scheduler does that when the worker returns.

use std::path::PathBuf;
use std::sync::Arc;

use trainyard_core::detection::PredictionResult;
use trainyard_core::job_spec::{Algorithm, JobSpec, PredictionSpec, TrainingSpec};
use trainyard_core::lifecycle::RunningState;
use trainyard_core::progress::EpochRecord;
use trainyard_core::store::{EpochSummary, JobStore, StoreError};
use trainyard_core::types::DeviceId;
use trainyard_core::weight::WeightState;

use crate::backend::{Backend, BackendError, SessionContext};
use crate::fetcher::{FetchError, WeightFetcher};
use crate::job::Job;

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WorkerError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

enum Flow {
    Completed,
    Cancelled,
}

/// Everything a worker needs besides the job itself.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub backend: Arc<dyn Backend>,
    pub fetcher: Arc<dyn WeightFetcher>,
    pub store: Arc<dyn JobStore>,
    pub trained_weight_dir: PathBuf,
}

/// Run `job` on `device` to completion, cancellation or failure.
pub(crate) async fn run(job: Arc<Job>, device: DeviceId, deps: Collaborators) -> WorkerOutcome {
    tracing::info!(job_id = %job.id(), device, kind = %job.kind(), "Worker started");

    let result = match job.spec().clone() {
        JobSpec::Training(spec) => train(&job, device, &deps, spec).await,
        JobSpec::Prediction(spec) => predict(&job, device, &deps, spec).await,
    };

    match result {
        Ok(Flow::Completed) => {
            tracing::info!(job_id = %job.id(), device, "Worker completed");
            WorkerOutcome::Completed
        }
        Ok(Flow::Cancelled) => {
            tracing::info!(job_id = %job.id(), device, "Worker observed cancellation");
            WorkerOutcome::Cancelled
        }
        Err(e) => {
            tracing::error!(job_id = %job.id(), device, error = %e, "Worker failed");
            WorkerOutcome::Failed(e.to_string())
        }
    }
}

/// Best-epoch weight file name of a training job.
pub(crate) fn best_weight_file(job: &Job) -> String {
    format!("best_model_{}.h5", job.id())
}

/// Run one blocking session call on the blocking pool, handing the session
/// back alongside the result.
async fn blocking<S, T, F>(mut session: S, call: F) -> Result<(S, T), WorkerError>
where
    S: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut S) -> Result<T, BackendError> + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        let out = call(&mut session);
        out.map(|value| (session, value))
    })
    .await;

    match joined {
        Ok(result) => Ok(result?),
        Err(e) => Err(WorkerError::Panicked(panic_message(e))),
    }
}

pub(crate) fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Weight acquisition
// ---------------------------------------------------------------------------

/// Make the pretrained weight available locally. `None` if the job was
/// cancelled while downloading.
async fn acquire_weight(
    job: &Arc<Job>,
    deps: &Collaborators,
    algorithm: Algorithm,
) -> Result<Option<PathBuf>, WorkerError> {
    if let Some(path) = deps.fetcher.cached(algorithm).await {
        job.update_weight(|w| w.mark_exists());
        tracing::debug!(job_id = %job.id(), path = %path.display(), "Pretrained weight cached");
        return Ok(Some(path));
    }

    job.update_weight(|w| w.begin_download());
    let reporter = Arc::clone(job);
    let report = move |percentage: u8| reporter.update_weight(|w| w.report(percentage));

    match deps
        .fetcher
        .download(algorithm, &report, job.cancellation())
        .await
    {
        Ok(path) => {
            job.update_weight(|w| match w.state() {
                WeightState::Exists => Ok(()),
                _ => w.mark_exists(),
            });
            Ok(Some(path))
        }
        Err(FetchError::Cancelled) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

async fn train(
    job: &Arc<Job>,
    device: DeviceId,
    deps: &Collaborators,
    spec: TrainingSpec,
) -> Result<Flow, WorkerError> {
    job.publish(|p| p.with_running_state(RunningState::Starting));

    let pretrained = if spec.load_pretrained_weight {
        match acquire_weight(job, deps, spec.algorithm()).await? {
            Some(path) => Some(path),
            None => return Ok(Flow::Cancelled),
        }
    } else {
        None
    };

    if job.is_cancelled() {
        return Ok(Flow::Cancelled);
    }

    let ctx = SessionContext {
        job_id: job.id(),
        device,
    };
    let backend = Arc::clone(&deps.backend);
    let open_spec = spec.clone();
    let (_, mut session) = blocking((), move |_| {
        backend.open_training(ctx, &open_spec, pretrained.as_deref())
    })
    .await?;

    let total_batch = session.batch_count();
    let mut best_map: Option<f64> = None;

    for epoch in 0..spec.total_epoch {
        job.publish(|p| p.with_pass_started(RunningState::Training, total_batch));
        let mut loss_sum = 0.0;

        for batch in 0..total_batch {
            if job.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            let (s, loss) = blocking(session, move |s| s.train_batch(batch)).await?;
            session = s;
            loss_sum += loss;
            job.publish(|p| p.with_batch(batch + 1, loss));
        }

        if job.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        job.publish(|p| p.with_running_state(RunningState::Validating));
        let (s, outcome) = blocking(session, |s| s.validate()).await?;
        session = s;

        let is_best = !outcome.map.is_nan() && best_map.map_or(true, |best| outcome.map >= best);
        let weight_file = if is_best {
            let name = best_weight_file(job);
            let path = deps.trained_weight_dir.join(&name);
            let (s, ()) = blocking(session, move |s| s.save_weights(&path)).await?;
            session = s;
            best_map = Some(outcome.map);
            Some(name)
        } else {
            None
        };

        let train_loss = if total_batch == 0 {
            0.0
        } else {
            loss_sum / total_batch as f64
        };
        let summary = EpochSummary {
            job_id: job.id(),
            epoch,
            train_loss,
            valid_loss: outcome.loss,
            valid_iou: outcome.iou,
            valid_map: outcome.map,
            weight_file,
        };
        job.publish(|p| {
            p.with_epoch(EpochRecord {
                train_loss,
                valid_loss: outcome.loss,
                valid_iou: outcome.iou,
                valid_map: outcome.map,
                prediction: outcome.prediction,
            })
        });
        deps.store.save_epoch(&summary).await?;

        tracing::debug!(
            job_id = %job.id(),
            epoch,
            train_loss,
            valid_map = outcome.map,
            best = summary.weight_file.is_some(),
            "Epoch completed",
        );
    }

    Ok(Flow::Completed)
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

async fn predict(
    job: &Arc<Job>,
    device: DeviceId,
    deps: &Collaborators,
    spec: PredictionSpec,
) -> Result<Flow, WorkerError> {
    job.publish(|p| p.with_running_state(RunningState::Starting));
    if job.is_cancelled() {
        return Ok(Flow::Cancelled);
    }

    let ctx = SessionContext {
        job_id: job.id(),
        device,
    };
    let backend = Arc::clone(&deps.backend);
    let weight = deps.trained_weight_dir.join(&spec.weight_file);
    let (_, mut session) =
        blocking((), move |_| backend.open_prediction(ctx, &spec, &weight)).await?;

    let total_batch = session.batch_count();
    job.publish(|p| p.with_pass_started(RunningState::Predicting, total_batch));
    let mut images = Vec::new();

    for batch in 0..total_batch {
        if job.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        let (s, predicted) = blocking(session, move |s| s.predict_batch(batch)).await?;
        session = s;
        images.extend(predicted);
        job.publish(|p| p.with_batch(batch + 1, 0.0));
    }

    job.set_prediction(PredictionResult { images });
    Ok(Flow::Completed)
}
