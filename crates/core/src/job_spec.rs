//! Job submission requests and their validated specifications.
//!
//! Clients send a [`SubmitJob`]. Admission turns it into a [`JobSpec`]
//! or rejects it with [`CoreError::Validation`]; nothing is registered for
//! a rejected request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::types::{JobId, JobKind};

/// Batch size used by prediction jobs that do not specify one.
pub const DEFAULT_PREDICTION_BATCH_SIZE: u32 = 16;

// ---------------------------------------------------------------------------
// Algorithm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Yolov1,
    Yolov2,
    Ssd,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Yolov1 => "yolov1",
            Algorithm::Yolov2 => "yolov2",
            Algorithm::Ssd => "ssd",
        }
    }

    /// File name of the pretrained weight for this algorithm.
    pub fn pretrained_weight_file(self) -> &'static str {
        match self {
            Algorithm::Yolov1 => "Yolov1.h5",
            Algorithm::Yolov2 => "Yolov2.h5",
            Algorithm::Ssd => "SSD.h5",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yolov1" => Ok(Algorithm::Yolov1),
            "yolov2" => Ok(Algorithm::Yolov2),
            "ssd" => Ok(Algorithm::Ssd),
            other => Err(CoreError::Validation(format!("unknown algorithm '{other}'"))),
        }
    }
}

/// Algorithm-specific parameters after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum AlgorithmParams {
    Yolov1 { cells: u32, bounding_box: u32 },
    Yolov2 { anchor: u32 },
    Ssd,
}

impl AlgorithmParams {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            AlgorithmParams::Yolov1 { .. } => Algorithm::Yolov1,
            AlgorithmParams::Yolov2 { .. } => Algorithm::Yolov2,
            AlgorithmParams::Ssd => Algorithm::Ssd,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct HyperParameters {
    #[validate(range(min = 1, message = "batch_size must be positive"))]
    pub batch_size: i64,
    #[validate(range(min = 1, message = "total_epoch must be positive"))]
    pub total_epoch: i64,
    #[validate(range(min = 1, message = "image_width must be positive"))]
    pub image_width: i64,
    #[validate(range(min = 1, message = "image_height must be positive"))]
    pub image_height: i64,
    #[serde(default = "default_true")]
    pub load_pretrained_weight: bool,
}

/// Raw algorithm parameters; which fields are required depends on the
/// algorithm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmParamsRequest {
    pub cells: Option<i64>,
    pub bounding_box: Option<i64>,
    pub anchor: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TrainingRequest {
    #[validate(length(min = 1, message = "dataset_ref must not be empty"))]
    pub dataset_ref: String,
    #[validate(nested)]
    pub hyper_parameters: HyperParameters,
    pub algorithm: String,
    #[serde(default)]
    pub algorithm_params: AlgorithmParamsRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PredictionRequest {
    pub source_job: JobId,
    #[validate(length(min = 1, message = "dataset_ref must not be empty"))]
    pub dataset_ref: String,
    #[validate(range(min = 1, message = "batch_size must be positive"))]
    pub batch_size: Option<i64>,
}

/// A job submission, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubmitJob {
    Training(TrainingRequest),
    Prediction(PredictionRequest),
}

impl SubmitJob {
    pub fn kind(&self) -> JobKind {
        match self {
            SubmitJob::Training(_) => JobKind::Training,
            SubmitJob::Prediction(_) => JobKind::Prediction,
        }
    }
}

// ---------------------------------------------------------------------------
// Validated specifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSpec {
    pub dataset_ref: String,
    pub batch_size: u32,
    pub total_epoch: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub load_pretrained_weight: bool,
    pub params: AlgorithmParams,
}

impl TrainingSpec {
    pub fn algorithm(&self) -> Algorithm {
        self.params.algorithm()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSpec {
    pub source_job: JobId,
    pub dataset_ref: String,
    pub batch_size: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub params: AlgorithmParams,
    /// Best-epoch weight file of the source training job.
    pub weight_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    Training(TrainingSpec),
    Prediction(PredictionSpec),
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            JobSpec::Training(_) => JobKind::Training,
            JobSpec::Prediction(_) => JobKind::Prediction,
        }
    }

    pub fn dataset_ref(&self) -> &str {
        match self {
            JobSpec::Training(t) => &t.dataset_ref,
            JobSpec::Prediction(p) => &p.dataset_ref,
        }
    }

    /// `true` for training jobs that must acquire a pretrained weight first.
    pub fn needs_pretrained_weight(&self) -> bool {
        matches!(self, JobSpec::Training(t) if t.load_pretrained_weight)
    }

    pub fn total_epoch(&self) -> u64 {
        match self {
            JobSpec::Training(t) => u64::from(t.total_epoch),
            JobSpec::Prediction(_) => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

fn validation_error(err: validator::ValidationErrors) -> CoreError {
    CoreError::Validation(err.to_string())
}

fn positive(value: Option<i64>, field: &str, algorithm: Algorithm) -> Result<u32, CoreError> {
    match value {
        Some(v) if v > 0 => u32::try_from(v)
            .map_err(|_| CoreError::Validation(format!("{field} is out of range"))),
        Some(_) => Err(CoreError::Validation(format!("{field} must be positive"))),
        None => Err(CoreError::Validation(format!(
            "{algorithm} requires algorithm_params.{field}"
        ))),
    }
}

fn to_u32(value: i64, field: &str) -> Result<u32, CoreError> {
    u32::try_from(value).map_err(|_| CoreError::Validation(format!("{field} is out of range")))
}

impl AlgorithmParamsRequest {
    pub fn resolve(&self, algorithm: Algorithm) -> Result<AlgorithmParams, CoreError> {
        match algorithm {
            Algorithm::Yolov1 => Ok(AlgorithmParams::Yolov1 {
                cells: positive(self.cells, "cells", algorithm)?,
                bounding_box: positive(self.bounding_box, "bounding_box", algorithm)?,
            }),
            Algorithm::Yolov2 => Ok(AlgorithmParams::Yolov2 {
                anchor: positive(self.anchor, "anchor", algorithm)?,
            }),
            Algorithm::Ssd => Ok(AlgorithmParams::Ssd),
        }
    }
}

impl TrainingRequest {
    /// Validate the request into a [`TrainingSpec`].
    pub fn into_spec(self) -> Result<TrainingSpec, CoreError> {
        self.validate().map_err(validation_error)?;
        let algorithm: Algorithm = self.algorithm.parse()?;
        let params = self.algorithm_params.resolve(algorithm)?;
        let hp = &self.hyper_parameters;
        Ok(TrainingSpec {
            batch_size: to_u32(hp.batch_size, "batch_size")?,
            total_epoch: to_u32(hp.total_epoch, "total_epoch")?,
            image_width: to_u32(hp.image_width, "image_width")?,
            image_height: to_u32(hp.image_height, "image_height")?,
            load_pretrained_weight: hp.load_pretrained_weight,
            dataset_ref: self.dataset_ref,
            params,
        })
    }
}

impl PredictionRequest {
    /// Structural checks that need no source job.
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate().map_err(validation_error)
    }

    /// Validate the request against the source training job's spec and its
    /// recorded best weight.
    pub fn into_spec(
        self,
        source: &JobSpec,
        best_weight: Option<&str>,
    ) -> Result<PredictionSpec, CoreError> {
        self.check()?;
        let training = match source {
            JobSpec::Training(t) => t,
            JobSpec::Prediction(_) => {
                return Err(CoreError::Validation(format!(
                    "source job {} is not a training job",
                    self.source_job
                )))
            }
        };
        let weight_file = best_weight.ok_or_else(|| {
            CoreError::Validation(format!(
                "source job {} has no trained weight",
                self.source_job
            ))
        })?;
        let batch_size = match self.batch_size {
            Some(v) => to_u32(v, "batch_size")?,
            None => DEFAULT_PREDICTION_BATCH_SIZE,
        };
        Ok(PredictionSpec {
            source_job: self.source_job,
            dataset_ref: self.dataset_ref,
            batch_size,
            image_width: training.image_width,
            image_height: training.image_height,
            params: training.params,
            weight_file: weight_file.to_string(),
        })
    }
}
