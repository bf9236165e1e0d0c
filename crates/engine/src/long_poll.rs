//! Long-poll progress endpoint.
//!
//! [`LongPollService::wait_for_update`] checks the job up to
//! `max_wait_iterations` times, `poll_interval` apart, and returns as soon
//! as something the client has not seen yet is observable:
//!
//! - A new completed epoch: the full report with every epoch-indexed list
//!   and the best epoch.
//! - A batch change, a state change or an ongoing weight download: the
//!   light report with empty lists.
//!
//! Otherwise it returns [`PollOutcome::Timeout`] and the client re-polls.
//! Polling only reads snapshots, so it never holds up a worker or the
//! scheduler.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use trainyard_core::detection::PredictedImage;
use trainyard_core::lifecycle::{JobState, RunningState};
use trainyard_core::types::JobId;
use trainyard_core::weight::WeightState;

use crate::config::PollConfig;
use crate::error::EngineError;
use crate::job::JobObservation;
use crate::scheduler::JobScheduler;

/// What the client saw in its previous response.
///
/// Omitted fields are not compared. A client that sends neither `state`
/// nor `running_state` has seen nothing yet, so its poll returns
/// immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct LastKnown {
    #[serde(default, rename = "last_epoch")]
    pub epoch: u64,
    #[serde(default, rename = "last_batch")]
    pub batch: u64,
    pub running_state: Option<RunningState>,
    pub state: Option<JobState>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub total_batch: u64,
    pub last_batch: u64,
    pub last_epoch: u64,
    pub total_epoch: u64,
    pub batch_loss: f64,
    pub running_state: RunningState,
    pub state: JobState,
    pub error_message: Option<String>,
    pub validation_loss_list: Vec<f64>,
    pub train_loss_list: Vec<f64>,
    pub best_epoch: u64,
    pub best_epoch_iou: f64,
    pub best_epoch_map: f64,
    pub best_epoch_validation_result: Vec<PredictedImage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Update(StatusReport),
    Timeout,
}

impl StatusReport {
    /// Batch-boundary report: progress fields only.
    pub fn light(obs: &JobObservation) -> Self {
        let p = &obs.progress;
        Self {
            total_batch: p.total_batch,
            last_batch: p.current_batch,
            last_epoch: p.current_epoch,
            total_epoch: p.total_epoch,
            batch_loss: p.last_batch_loss,
            running_state: obs.running_state,
            state: obs.state,
            error_message: obs.error_message.clone(),
            validation_loss_list: Vec::new(),
            train_loss_list: Vec::new(),
            best_epoch: 0,
            best_epoch_iou: 0.0,
            best_epoch_map: 0.0,
            best_epoch_validation_result: Vec::new(),
        }
    }

    /// Epoch-boundary report: progress plus histories and the best epoch.
    pub fn full(obs: &JobObservation) -> Self {
        let history = &obs.progress.history;
        let mut report = Self::light(obs);
        report.validation_loss_list = history.valid_loss_list();
        report.train_loss_list = history.train_loss_list();
        if let Some((idx, best)) = history.best() {
            report.best_epoch = idx as u64;
            report.best_epoch_iou = best.valid_iou;
            report.best_epoch_map = best.valid_map;
            report.best_epoch_validation_result = best.prediction.clone();
        }
        report
    }
}

/// Decide what, if anything, to report for `obs` given what the client
/// last saw.
pub fn evaluate(obs: &JobObservation, last: &LastKnown) -> Option<StatusReport> {
    let p = &obs.progress;
    if p.current_epoch != last.epoch && !p.history.is_empty() {
        return Some(StatusReport::full(obs));
    }

    // Only the fields the client sent are compared. With neither sent, the
    // client has seen nothing yet.
    let state_changed = match (last.state, last.running_state) {
        (None, None) => true,
        (state, running_state) => {
            state.is_some_and(|s| s != obs.state)
                || running_state.is_some_and(|r| r != obs.running_state)
        }
    };
    let downloading = obs.weight.map(|w| w.state()) == Some(WeightState::Downloading);
    if p.current_batch != last.batch || state_changed || downloading {
        return Some(StatusReport::light(obs));
    }
    None
}

/// Interval ticker on the monotonic clock. The first tick completes
/// immediately, so a poll checks before its first sleep.
pub(crate) fn poll_ticker(config: PollConfig) -> tokio::time::Interval {
    let period = config.poll_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub struct LongPollService {
    scheduler: Arc<JobScheduler>,
    config: PollConfig,
}

impl LongPollService {
    pub fn new(scheduler: Arc<JobScheduler>, config: PollConfig) -> Self {
        Self { scheduler, config }
    }

    pub fn config(&self) -> PollConfig {
        self.config
    }

    /// Wait until the job shows something newer than `last`, or time out.
    pub async fn wait_for_update(
        &self,
        id: JobId,
        last: &LastKnown,
    ) -> Result<PollOutcome, EngineError> {
        let job = self.scheduler.job(id).ok_or(EngineError::NotFound(id))?;

        let mut ticker = poll_ticker(self.config);
        for _ in 0..self.config.max_wait_iterations {
            ticker.tick().await;
            if let Some(report) = evaluate(&job.observe(), last) {
                return Ok(PollOutcome::Update(report));
            }
        }
        Ok(PollOutcome::Timeout)
    }
}
