//! Persistence collaborator.
//!
//! The scheduler only talks to storage through [`JobStore`]. Implementations
//! are expected to be transactional per call; the scheduler never relies on
//! multi-call atomicity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job_spec::JobSpec;
use crate::lifecycle::JobState;
use crate::types::{JobId, JobKind, Timestamp};

/// A job as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub spec: JobSpec,
    pub state: JobState,
    pub error_message: Option<String>,
    pub best_epoch: Option<u32>,
    /// File name of the best-epoch weight, relative to the trained weight
    /// directory.
    pub best_weight: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Metrics of one completed epoch, written after every epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub job_id: JobId,
    pub epoch: u32,
    pub train_loss: f64,
    pub valid_loss: f64,
    pub valid_iou: f64,
    pub valid_map: f64,
    /// Set when this epoch became the new best; the store records it as the
    /// job's best weight.
    pub weight_file: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Job not found in store: {0}")]
    NotFound(JobId),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a newly admitted job in `Reserved` state.
    async fn register_job(&self, id: JobId, spec: &JobSpec) -> Result<(), StoreError>;

    async fn fetch_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    async fn save_job_state(
        &self,
        id: JobId,
        state: JobState,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn save_epoch(&self, epoch: &EpochSummary) -> Result<(), StoreError>;

    /// Remove the job's persisted best-epoch weight, if any. Removing a
    /// weight that does not exist is not an error.
    async fn delete_weight_file(&self, id: JobId) -> Result<(), StoreError>;
}
