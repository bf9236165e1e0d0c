//! Progress snapshots published by a running job.
//!
//! A [`ProgressSnapshot`] is a value: the worker builds a new one from the
//! previous with the `with_*` methods and publishes it whole. Readers clone
//! the current snapshot and never see fields from two different points in
//! time.
//!
//! The per-epoch metrics live in [`EpochHistory`] as one record per
//! completed epoch, so the train-loss / valid-loss / IoU / mAP sequences are
//! index-aligned by construction. The history sits behind an `Arc`, which
//! keeps batch-level publication cheap: only an epoch boundary allocates a
//! new history.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::detection::PredictedImage;
use crate::lifecycle::RunningState;

// ---------------------------------------------------------------------------
// Epoch history
// ---------------------------------------------------------------------------

/// Metrics recorded at the end of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub train_loss: f64,
    pub valid_loss: f64,
    pub valid_iou: f64,
    pub valid_map: f64,
    /// Validation predictions made with this epoch's weights.
    pub prediction: Vec<PredictedImage>,
}

/// Append-only list of [`EpochRecord`]s, index `i` being the `i`-th
/// completed epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochHistory {
    records: Vec<EpochRecord>,
}

impl EpochHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn get(&self, epoch: usize) -> Option<&EpochRecord> {
        self.records.get(epoch)
    }

    /// History extended by one epoch.
    pub fn appended(&self, record: EpochRecord) -> Self {
        let mut records = Vec::with_capacity(self.records.len() + 1);
        records.extend_from_slice(&self.records);
        records.push(record);
        Self { records }
    }

    pub fn train_loss_list(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.train_loss).collect()
    }

    pub fn valid_loss_list(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.valid_loss).collect()
    }

    pub fn valid_iou_list(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.valid_iou).collect()
    }

    pub fn valid_map_list(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.valid_map).collect()
    }

    /// Index of the best epoch by validation mAP. See [`best_epoch`].
    pub fn best_epoch(&self) -> Option<usize> {
        best_epoch(&self.valid_map_list())
    }

    /// The best epoch's index together with its record.
    pub fn best(&self) -> Option<(usize, &EpochRecord)> {
        let idx = self.best_epoch()?;
        self.records.get(idx).map(|r| (idx, r))
    }
}

/// Last index at which `values` attains its maximum.
///
/// Ties go to the most recent epoch: `[0.5, 0.9, 0.9, 0.7]` yields `2`.
/// NaN entries are never selected. Returns `None` for an empty slice or one
/// containing only NaNs.
pub fn best_epoch(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value < current => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

// ---------------------------------------------------------------------------
// ProgressSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of a job's progress.
///
/// `current_epoch` counts completed epochs and always equals
/// `history.len()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub running_state: RunningState,
    pub current_batch: u64,
    pub total_batch: u64,
    pub current_epoch: u64,
    pub total_epoch: u64,
    pub last_batch_loss: f64,
    pub history: Arc<EpochHistory>,
}

impl ProgressSnapshot {
    /// Initial snapshot for a job expected to run `total_epoch` epochs.
    pub fn new(total_epoch: u64) -> Self {
        Self {
            total_epoch,
            ..Self::default()
        }
    }

    pub fn with_running_state(&self, running_state: RunningState) -> Self {
        Self {
            running_state,
            ..self.clone()
        }
    }

    /// Start a new pass of `total_batch` batches with the batch counter reset.
    pub fn with_pass_started(&self, running_state: RunningState, total_batch: u64) -> Self {
        Self {
            running_state,
            current_batch: 0,
            total_batch,
            ..self.clone()
        }
    }

    /// Record a completed batch. `current_batch` is clamped to `total_batch`.
    pub fn with_batch(&self, current_batch: u64, loss: f64) -> Self {
        Self {
            current_batch: current_batch.min(self.total_batch),
            last_batch_loss: loss,
            ..self.clone()
        }
    }

    /// Append one completed epoch and advance `current_epoch`.
    pub fn with_epoch(&self, record: EpochRecord) -> Self {
        let history = Arc::new(self.history.appended(record));
        Self {
            current_epoch: history.len() as u64,
            history,
            ..self.clone()
        }
    }
}
