use std::time::Duration;

use trainyard_core::error::CoreError;
use trainyard_core::lifecycle::TransitionError;
use trainyard_core::store::StoreError;
use trainyard_core::types::JobId;

/// Errors returned by scheduler operations and the polling services.
///
/// A worker failure is never returned from here; it is recorded on the
/// job and reported through its status.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The job specification is malformed. Nothing was registered.
    #[error("Admission rejected: {0}")]
    Admission(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The worker did not exit within the stop timeout. The job stays in
    /// `stopping` and keeps its slot until the worker does exit.
    #[error("Job {id} did not acknowledge cancellation within {}s", waited.as_secs_f64())]
    CancellationStall { id: JobId, waited: Duration },

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => EngineError::Admission(msg),
            other => EngineError::Admission(other.to_string()),
        }
    }
}
