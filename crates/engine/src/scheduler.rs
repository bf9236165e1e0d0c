//! Admission control over a fixed set of device slots.
//!
//! [`JobScheduler`] owns the job registry. Every lifecycle transition
//! happens under the registry lock, which makes the registry the single
//! writer of job state:
//!
//! - `submit` registers a job as `reserved` and runs a promotion sweep.
//! - Promotion moves the oldest reserved job (by submission sequence) to
//!   `running` while a device is free, and hands it to a worker task.
//! - When a worker returns, its slot is released, the job is finished and
//!   another sweep runs.
//!
//! A job holds its device from promotion until its worker has exited, so
//! a stopping or deleted job whose worker is still running keeps its slot
//! and at most N workers ever run at once.
//!
//! A deleted job leaves the registry once it has no worker left; only its
//! id is remembered so that `stop`/`delete` stay idempotent.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use trainyard_core::detection::PredictionResult;
use trainyard_core::job_spec::{JobSpec, SubmitJob};
use trainyard_core::lifecycle::{JobState, RunningState};
use trainyard_core::store::JobStore;
use trainyard_core::types::{DeviceId, JobId, JobKind, Timestamp};
use trainyard_core::weight::WeightStatus;

use crate::backend::Backend;
use crate::config::SchedulerConfig;
use crate::error::EngineError;
use crate::fetcher::WeightFetcher;
use crate::job::{Job, JobObservation};
use crate::sync::lock;
use crate::worker::{self, Collaborators, WorkerOutcome};

pub struct JobScheduler {
    config: SchedulerConfig,
    registry: Mutex<Registry>,
    deps: Collaborators,
}

struct Registry {
    jobs: HashMap<JobId, Arc<Job>>,
    /// Reserved jobs keyed by submission sequence.
    reserved: BTreeMap<u64, JobId>,
    /// Jobs holding a device slot.
    slots: HashMap<JobId, DeviceId>,
    free_devices: BTreeSet<DeviceId>,
    /// Deleted jobs whose weight is removed when their worker exits.
    purge_on_exit: HashSet<JobId>,
    /// Ids of deleted jobs already evicted from `jobs`.
    evicted: HashSet<JobId>,
    next_seq: u64,
    accepting: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSummary {
    pub capacity: usize,
    pub active: usize,
    pub reserved: usize,
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub running_state: RunningState,
    pub error_message: Option<String>,
    pub submitted_at: Timestamp,
}

enum StopPlan {
    Persist,
    Wait(watch::Receiver<bool>),
    Nothing,
}

enum DeletePlan {
    Purge,
    Wait(watch::Receiver<bool>),
}

impl JobScheduler {
    /// Create a scheduler with `config.slot_count` device slots (at least
    /// one), numbered from 0.
    pub fn new(
        config: SchedulerConfig,
        backend: Arc<dyn Backend>,
        fetcher: Arc<dyn WeightFetcher>,
        store: Arc<dyn JobStore>,
    ) -> Arc<Self> {
        let slot_count = config.slot_count.max(1);
        let free_devices = (0..slot_count as DeviceId).collect();
        let deps = Collaborators {
            backend,
            fetcher,
            store,
            trained_weight_dir: config.trained_weight_dir.clone(),
        };

        tracing::info!(slots = slot_count, "Job scheduler created");

        Arc::new(Self {
            config: SchedulerConfig {
                slot_count,
                ..config
            },
            registry: Mutex::new(Registry {
                jobs: HashMap::new(),
                reserved: BTreeMap::new(),
                slots: HashMap::new(),
                free_devices,
                purge_on_exit: HashSet::new(),
                evicted: HashSet::new(),
                next_seq: 0,
                accepting: true,
            }),
            deps,
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    /// N, the number of device slots.
    pub fn capacity(&self) -> usize {
        self.config.slot_count
    }

    /// Number of jobs currently holding a device slot. Never exceeds
    /// [`capacity`](Self::capacity).
    pub fn active_count(&self) -> usize {
        self.registry().slots.len()
    }

    pub fn reserved_count(&self) -> usize {
        self.registry().reserved.len()
    }

    pub fn job(&self, id: JobId) -> Option<Arc<Job>> {
        self.registry().jobs.get(&id).cloned()
    }

    fn get(&self, id: JobId) -> Result<Arc<Job>, EngineError> {
        self.job(id).ok_or(EngineError::NotFound(id))
    }

    pub fn state(&self, id: JobId) -> Result<JobState, EngineError> {
        Ok(self.get(id)?.state())
    }

    pub fn observe(&self, id: JobId) -> Result<JobObservation, EngineError> {
        Ok(self.get(id)?.observe())
    }

    pub fn weight_status(&self, id: JobId) -> Result<Option<WeightStatus>, EngineError> {
        Ok(self.get(id)?.weight_status())
    }

    /// Detections of a finished prediction job. `None` while the job has
    /// not completed, for training jobs and for deleted jobs whose worker
    /// is still exiting.
    pub fn prediction_result(
        &self,
        id: JobId,
    ) -> Result<Option<Arc<PredictionResult>>, EngineError> {
        let job = self.get(id)?;
        if job.state() == JobState::Deleted {
            return Ok(None);
        }
        Ok(job.prediction())
    }

    pub fn summary(&self) -> SchedulerSummary {
        let reg = self.registry();
        let mut jobs: Vec<&Arc<Job>> = reg.jobs.values().collect();
        jobs.sort_by_key(|job| job.seq());

        let jobs = jobs
            .into_iter()
            .map(|job| job.observe())
            .filter(|obs| obs.state != JobState::Deleted)
            .map(|obs| JobSummary {
                id: obs.id,
                kind: obs.kind,
                state: obs.state,
                running_state: obs.running_state,
                error_message: obs.error_message,
                submitted_at: obs.submitted_at,
            })
            .collect();

        SchedulerSummary {
            capacity: self.capacity(),
            active: reg.slots.len(),
            reserved: reg.reserved.len(),
            jobs,
        }
    }

    // ---- submission ----

    /// Validate and register a job, then run a promotion sweep.
    ///
    /// Never waits for a slot: if all slots are busy the job stays
    /// `reserved`.
    pub async fn submit(self: &Arc<Self>, request: SubmitJob) -> Result<JobId, EngineError> {
        if !self.registry().accepting {
            return Err(EngineError::ShuttingDown);
        }

        let spec = match self.admit(request).await {
            Ok(spec) => spec,
            Err(e) => {
                tracing::info!(error = %e, "Job submission rejected");
                return Err(e);
            }
        };

        let id = JobId::new();
        self.deps.store.register_job(id, &spec).await?;

        let registered = {
            let mut reg = self.registry();
            if reg.accepting {
                let seq = reg.next_seq;
                reg.next_seq += 1;

                let job = Arc::new(Job::new(id, spec, seq));
                reg.jobs.insert(id, Arc::clone(&job));
                reg.reserved.insert(seq, id);
                self.promote_locked(&mut reg);
                Some((seq, job.state()))
            } else {
                None
            }
        };

        let Some((seq, state)) = registered else {
            // Shutdown began while the record was being written.
            if let Err(e) = self
                .deps
                .store
                .save_job_state(id, JobState::Finished, None)
                .await
            {
                tracing::error!(job_id = %id, error = %e, "Failed to close out refused job");
            }
            return Err(EngineError::ShuttingDown);
        };

        tracing::info!(job_id = %id, seq, state = %state, "Job submitted");
        Ok(id)
    }

    async fn admit(&self, request: SubmitJob) -> Result<JobSpec, EngineError> {
        match request {
            SubmitJob::Training(req) => Ok(JobSpec::Training(req.into_spec()?)),
            SubmitJob::Prediction(req) => {
                req.check()?;
                let source_id = req.source_job;
                let source = self.deps.store.fetch_job(source_id).await?.ok_or_else(|| {
                    EngineError::Admission(format!("source job {source_id} not found"))
                })?;

                let state = self
                    .job(source_id)
                    .map(|job| job.state())
                    .unwrap_or(source.state);
                if state != JobState::Finished {
                    return Err(EngineError::Admission(format!(
                        "source job {source_id} is {state}, not finished"
                    )));
                }

                let spec = req.into_spec(&source.spec, source.best_weight.as_deref())?;
                Ok(JobSpec::Prediction(spec))
            }
        }
    }

    // ---- promotion and completion ----

    /// Promote reserved jobs in submission order while a slot is free.
    fn promote_locked(self: &Arc<Self>, reg: &mut Registry) {
        if !reg.accepting {
            return;
        }
        while reg.slots.len() < self.capacity() {
            let Some(device) = reg.free_devices.first().copied() else {
                break;
            };
            let Some((_, id)) = reg.reserved.pop_first() else {
                break;
            };
            let Some(job) = reg.jobs.get(&id).cloned() else {
                continue;
            };

            if let Err(e) = job.lifecycle().transition(JobState::Running) {
                tracing::warn!(job_id = %id, error = %e, "Skipping promotion");
                continue;
            }

            reg.free_devices.remove(&device);
            reg.slots.insert(id, device);
            tracing::info!(job_id = %id, seq = job.seq(), device, "Job promoted");
            self.dispatch(job, device);
        }
    }

    /// Run the job's worker on `device`. A supervising task catches worker
    /// panics and always routes the exit through [`complete`](Self::complete).
    fn dispatch(self: &Arc<Self>, job: Arc<Job>, device: DeviceId) {
        let scheduler = Arc::clone(self);
        let deps = self.deps.clone();

        tokio::spawn(async move {
            let worker = tokio::spawn(worker::run(Arc::clone(&job), device, deps));
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = worker::panic_message(e);
                    tracing::error!(job_id = %job.id(), device, error = %message, "Worker panicked");
                    WorkerOutcome::Failed(format!("Worker panicked: {message}"))
                }
            };
            scheduler.complete(job, device, outcome).await;
        });
    }

    /// Release the slot of an exited worker, finish the job and promote.
    async fn complete(self: &Arc<Self>, job: Arc<Job>, device: DeviceId, outcome: WorkerOutcome) {
        let id = job.id();

        let (state, error_message, purge) = {
            let mut reg = self.registry();
            reg.slots.remove(&id);
            reg.free_devices.insert(device);
            let purge = reg.purge_on_exit.remove(&id);

            let (state, error_message) = {
                let mut lc = job.lifecycle();
                let result = match &outcome {
                    WorkerOutcome::Failed(message) => lc.fail(message.clone()),
                    WorkerOutcome::Completed | WorkerOutcome::Cancelled => {
                        lc.transition(JobState::Finished)
                    }
                };
                if let Err(e) = result {
                    if lc.state() != JobState::Deleted {
                        tracing::warn!(job_id = %id, error = %e, "Rejected completion transition");
                    }
                }
                (lc.state(), lc.error_message().map(str::to_string))
            };

            if state == JobState::Deleted {
                evict_locked(&mut reg, id);
            }
            self.promote_locked(&mut reg);
            (state, error_message, purge)
        };

        tracing::info!(job_id = %id, device, state = %state, outcome = ?outcome, "Slot released");

        if state == JobState::Finished {
            if let Err(e) = self
                .deps
                .store
                .save_job_state(id, state, error_message.as_deref())
                .await
            {
                tracing::error!(job_id = %id, error = %e, "Failed to persist job state");
            }
        }
        if purge {
            if let Err(e) = self.deps.store.delete_weight_file(id).await {
                tracing::error!(job_id = %id, error = %e, "Failed to delete weight file");
            }
        }

        job.mark_exited();
    }

    // ---- control ----

    /// Stop a job.
    ///
    /// A reserved job finishes immediately. A running job moves to
    /// `stopping`, its worker is signalled and the call waits until the
    /// worker has exited, or fails with
    /// [`EngineError::CancellationStall`] after the stop timeout. Stopping
    /// a finished or deleted job does nothing.
    pub async fn stop(self: &Arc<Self>, id: JobId) -> Result<(), EngineError> {
        let plan = {
            let mut reg = self.registry();
            if reg.evicted.contains(&id) {
                return Ok(());
            }
            let job = reg.jobs.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
            let mut lc = job.lifecycle();
            match lc.state() {
                JobState::Reserved => {
                    lc.transition(JobState::Finished)?;
                    drop(lc);
                    reg.reserved.remove(&job.seq());
                    self.promote_locked(&mut reg);
                    tracing::info!(job_id = %id, "Reserved job stopped before start");
                    StopPlan::Persist
                }
                JobState::Running => {
                    lc.transition(JobState::Stopping)?;
                    job.cancellation().cancel();
                    tracing::info!(job_id = %id, "Stop requested");
                    StopPlan::Wait(job.exit_receiver())
                }
                JobState::Stopping => StopPlan::Wait(job.exit_receiver()),
                JobState::Finished | JobState::Deleted => StopPlan::Nothing,
            }
        };

        match plan {
            StopPlan::Persist => {
                self.deps
                    .store
                    .save_job_state(id, JobState::Finished, None)
                    .await?;
                Ok(())
            }
            StopPlan::Wait(exited) => self.await_exit(id, exited).await,
            StopPlan::Nothing => Ok(()),
        }
    }

    /// Delete a job from any state. Idempotent.
    ///
    /// A live worker is signalled and awaited as in [`stop`](Self::stop).
    /// The job's weight file deletion is requested exactly once: directly
    /// when no worker is running, otherwise when the worker exits. The job
    /// is dropped from the registry at the same point, after which reads
    /// report [`EngineError::NotFound`].
    pub async fn delete(self: &Arc<Self>, id: JobId) -> Result<(), EngineError> {
        let plan = {
            let mut reg = self.registry();
            if reg.evicted.contains(&id) {
                return Ok(());
            }
            let job = reg.jobs.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
            let mut lc = job.lifecycle();
            let previous = lc.state();
            if previous == JobState::Deleted {
                return Ok(());
            }
            lc.transition(JobState::Deleted)?;
            drop(lc);

            if previous == JobState::Reserved {
                reg.reserved.remove(&job.seq());
            }
            let plan = if reg.slots.contains_key(&id) {
                job.cancellation().cancel();
                reg.purge_on_exit.insert(id);
                DeletePlan::Wait(job.exit_receiver())
            } else {
                evict_locked(&mut reg, id);
                DeletePlan::Purge
            };
            self.promote_locked(&mut reg);
            tracing::info!(job_id = %id, previous = %previous, "Job deleted");
            plan
        };

        let saved = self
            .deps
            .store
            .save_job_state(id, JobState::Deleted, None)
            .await;
        let outcome = match plan {
            DeletePlan::Wait(exited) => self.await_exit(id, exited).await,
            DeletePlan::Purge => self
                .deps
                .store
                .delete_weight_file(id)
                .await
                .map_err(EngineError::from),
        };
        saved?;
        outcome
    }

    async fn await_exit(
        &self,
        id: JobId,
        mut exited: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let waited = self.config.stop_timeout;
        let acknowledged = tokio::time::timeout(waited, exited.wait_for(|done| *done))
            .await
            .is_ok();
        if acknowledged {
            return Ok(());
        }
        tracing::warn!(
            job_id = %id,
            waited_secs = waited.as_secs_f64(),
            "Worker did not acknowledge cancellation",
        );
        Err(EngineError::CancellationStall { id, waited })
    }

    /// Stop accepting submissions, signal every live worker and wait up to
    /// `grace` for them to exit. Reserved jobs stay reserved.
    pub async fn shutdown(&self, grace: Duration) {
        let receivers: Vec<watch::Receiver<bool>> = {
            let mut reg = self.registry();
            reg.accepting = false;
            reg.slots
                .keys()
                .filter_map(|id| reg.jobs.get(id))
                .map(|job| {
                    let mut lc = job.lifecycle();
                    if lc.state() == JobState::Running {
                        let _ = lc.transition(JobState::Stopping);
                    }
                    job.cancellation().cancel();
                    job.exit_receiver()
                })
                .collect()
        };

        tracing::info!(workers = receivers.len(), "Job scheduler shutting down");

        let all_exited = async {
            for mut exited in receivers {
                let _ = exited.wait_for(|done| *done).await;
            }
        };
        if tokio::time::timeout(grace, all_exited).await.is_err() {
            tracing::warn!(
                grace_secs = grace.as_secs_f64(),
                "Workers still running after shutdown grace period",
            );
        } else {
            tracing::info!("Job scheduler shut down complete");
        }
    }
}

/// Drop a deleted job that no longer has a worker.
fn evict_locked(reg: &mut Registry, id: JobId) {
    if reg.jobs.remove(&id).is_some() {
        reg.evicted.insert(id);
        tracing::debug!(job_id = %id, "Deleted job evicted");
    }
}
