//! Long-poll endpoint for pretrained weight download progress.

use std::sync::Arc;

use trainyard_core::lifecycle::JobState;
use trainyard_core::types::JobId;
use trainyard_core::weight::{WeightState, WeightStatus};

use crate::config::PollConfig;
use crate::error::EngineError;
use crate::long_poll::poll_ticker;
use crate::scheduler::JobScheduler;

pub struct WeightProgressService {
    scheduler: Arc<JobScheduler>,
    config: PollConfig,
}

/// Percentage to report for `weight`, or `None` to keep waiting.
///
/// Jobs without a weight acquisition report 100. Once the job has ended
/// its current percentage is reported as-is.
pub fn evaluate(weight: Option<WeightStatus>, state: JobState, threshold: u8) -> Option<u8> {
    let Some(weight) = weight else {
        return Some(100);
    };
    match weight.state() {
        WeightState::Exists => Some(100),
        _ if matches!(state, JobState::Finished | JobState::Deleted) => Some(weight.percentage()),
        WeightState::Downloading if weight.percentage() > threshold => Some(weight.percentage()),
        _ => None,
    }
}

impl WeightProgressService {
    pub fn new(scheduler: Arc<JobScheduler>, config: PollConfig) -> Self {
        Self { scheduler, config }
    }

    /// Wait until the job's download passes `threshold` percent or the
    /// weight exists. `Ok(None)` on timeout; the caller re-polls.
    pub async fn poll(&self, id: JobId, threshold: u8) -> Result<Option<u8>, EngineError> {
        let job = self.scheduler.job(id).ok_or(EngineError::NotFound(id))?;

        let mut ticker = poll_ticker(self.config);
        for _ in 0..self.config.max_wait_iterations {
            ticker.tick().await;
            let obs = job.observe();
            if let Some(percentage) = evaluate(obs.weight, obs.state, threshold) {
                return Ok(Some(percentage));
            }
        }
        Ok(None)
    }
}
