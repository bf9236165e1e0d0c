//! Live job handle shared by the scheduler, the job's worker and pollers.
//!
//! Ownership of the mutable parts:
//!
//! - `lifecycle` is written only by the scheduler, under its registry lock.
//! - `progress`, `weight` and `prediction` are written only by the job's
//!   worker.
//! - Everyone else reads copies.
//!
//! Lock order is `lifecycle -> progress -> weight`. [`Job::observe`] takes
//! them in that order so a single observation is consistent across the
//! lifecycle state and the progress snapshot.

use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::sync::watch;
use trainyard_core::detection::PredictionResult;
use trainyard_core::job_spec::JobSpec;
use trainyard_core::lifecycle::{JobState, Lifecycle, RunningState};
use trainyard_core::progress::ProgressSnapshot;
use trainyard_core::types::{JobId, JobKind, Timestamp};
use trainyard_core::weight::{WeightStatus, WeightTransitionError};

use crate::cancellation::CancellationController;
use crate::sync::{lock, read, write};

pub struct Job {
    id: JobId,
    spec: JobSpec,
    /// Submission sequence number; FIFO promotion order.
    seq: u64,
    submitted_at: Timestamp,
    lifecycle: Mutex<Lifecycle>,
    progress: RwLock<Arc<ProgressSnapshot>>,
    /// Present only for jobs that need a pretrained weight.
    weight: Option<Mutex<WeightStatus>>,
    prediction: Mutex<Option<Arc<PredictionResult>>>,
    cancel: CancellationController,
    exited: watch::Sender<bool>,
}

/// One consistent view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobObservation {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub error_message: Option<String>,
    /// Published phase, or `stopping` while the job is stopping.
    pub running_state: RunningState,
    pub progress: Arc<ProgressSnapshot>,
    pub weight: Option<WeightStatus>,
    pub submitted_at: Timestamp,
}

impl Job {
    pub(crate) fn new(id: JobId, spec: JobSpec, seq: u64) -> Self {
        let progress = ProgressSnapshot::new(spec.total_epoch());
        let weight = spec
            .needs_pretrained_weight()
            .then(|| Mutex::new(WeightStatus::new()));
        let (exited, _) = watch::channel(false);
        Self {
            id,
            spec,
            seq,
            submitted_at: chrono::Utc::now(),
            lifecycle: Mutex::new(Lifecycle::new()),
            progress: RwLock::new(Arc::new(progress)),
            weight,
            prediction: Mutex::new(None),
            cancel: CancellationController::new(),
            exited,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.spec.kind()
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn submitted_at(&self) -> Timestamp {
        self.submitted_at
    }

    pub fn state(&self) -> JobState {
        lock(&self.lifecycle).state()
    }

    pub(crate) fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        lock(&self.lifecycle)
    }

    pub fn cancellation(&self) -> &CancellationController {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ---- progress ----

    /// Current progress snapshot.
    pub fn progress(&self) -> Arc<ProgressSnapshot> {
        Arc::clone(&read(&self.progress))
    }

    /// Replace the progress snapshot with one derived from the current one.
    pub(crate) fn publish(&self, next: impl FnOnce(&ProgressSnapshot) -> ProgressSnapshot) {
        let mut slot = write(&self.progress);
        let snapshot = next(&slot);
        *slot = Arc::new(snapshot);
    }

    // ---- weight acquisition ----

    pub fn weight_status(&self) -> Option<WeightStatus> {
        self.weight.as_ref().map(|w| *lock(w))
    }

    pub(crate) fn update_weight(
        &self,
        update: impl FnOnce(&mut WeightStatus) -> Result<(), WeightTransitionError>,
    ) {
        let Some(weight) = &self.weight else {
            return;
        };
        if let Err(e) = update(&mut lock(weight)) {
            tracing::warn!(job_id = %self.id, error = %e, "Rejected weight transition");
        }
    }

    // ---- prediction result ----

    pub fn prediction(&self) -> Option<Arc<PredictionResult>> {
        lock(&self.prediction).clone()
    }

    pub(crate) fn set_prediction(&self, result: PredictionResult) {
        *lock(&self.prediction) = Some(Arc::new(result));
    }

    // ---- worker exit ----

    pub(crate) fn exit_receiver(&self) -> watch::Receiver<bool> {
        self.exited.subscribe()
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.send_replace(true);
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Read lifecycle, progress and weight as one consistent observation.
    pub fn observe(&self) -> JobObservation {
        let lifecycle = lock(&self.lifecycle);
        let progress = self.progress();
        let weight = self.weight_status();
        JobObservation {
            id: self.id,
            kind: self.kind(),
            state: lifecycle.state(),
            error_message: lifecycle.error_message().map(str::to_string),
            running_state: RunningState::effective(lifecycle.state(), progress.running_state),
            progress,
            weight,
            submitted_at: self.submitted_at,
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("seq", &self.seq)
            .field("state", &self.state())
            .finish()
    }
}
