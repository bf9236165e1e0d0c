//! Compute collaborator.
//!
//! The engine never runs model code itself. A [`Backend`] opens a session
//! bound to one device, and the worker drives it one batch at a time.
//! Session calls are synchronous and may take as long as a batch takes; the
//! worker runs each one on the blocking thread pool.

pub mod python;

use std::path::Path;

use serde::{Deserialize, Serialize};
use trainyard_core::detection::PredictedImage;
use trainyard_core::job_spec::{PredictionSpec, TrainingSpec};
use trainyard_core::types::{DeviceId, JobId};

pub use python::PythonBackend;

/// Identifies the job and device a session runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub job_id: JobId,
    pub device: DeviceId,
}

/// Result of one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub loss: f64,
    pub iou: f64,
    pub map: f64,
    pub prediction: Vec<PredictedImage>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to start compute process: {0}")]
    Spawn(std::io::Error),

    #[error("Compute process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Compute protocol error: {0}")]
    Protocol(String),

    #[error("Compute process exited unexpectedly")]
    Exited,

    /// The model code itself raised.
    #[error("{0}")]
    Failed(String),
}

pub trait Backend: Send + Sync + 'static {
    fn open_training(
        &self,
        ctx: SessionContext,
        spec: &TrainingSpec,
        pretrained_weight: Option<&Path>,
    ) -> Result<Box<dyn TrainingSession>, BackendError>;

    fn open_prediction(
        &self,
        ctx: SessionContext,
        spec: &PredictionSpec,
        weight: &Path,
    ) -> Result<Box<dyn PredictionSession>, BackendError>;
}

pub trait TrainingSession: Send {
    /// Number of training batches per epoch.
    fn batch_count(&self) -> u64;

    /// Run one training batch, returning its loss.
    fn train_batch(&mut self, index: u64) -> Result<f64, BackendError>;

    /// Evaluate the current weights on the validation set.
    fn validate(&mut self) -> Result<ValidationOutcome, BackendError>;

    fn save_weights(&mut self, path: &Path) -> Result<(), BackendError>;
}

pub trait PredictionSession: Send {
    fn batch_count(&self) -> u64;

    fn predict_batch(&mut self, index: u64) -> Result<Vec<PredictedImage>, BackendError>;
}
