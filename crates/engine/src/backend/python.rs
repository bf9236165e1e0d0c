//! Python subprocess compute backend.
//!
//! Each session owns one child process running the trainer script with
//! `CUDA_VISIBLE_DEVICES` pinned to the slot's device. Requests and replies
//! are single-line JSON objects over stdin/stdout:
//!
//! ```text
//! -> {"op":"train_batch","index":3}
//! <- {"type":"log","level":"info","message":"..."}      (any number)
//! <- {"type":"result","data":1.234}
//! ```
//!
//! A `{"type":"error","message":...}` reply fails the call. The child is
//! killed when the session is dropped.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trainyard_core::detection::PredictedImage;
use trainyard_core::job_spec::{PredictionSpec, TrainingSpec};
use trainyard_core::types::JobId;

use super::{
    Backend, BackendError, PredictionSession, SessionContext, TrainingSession, ValidationOutcome,
};

/// Spawns one trainer process per session.
#[derive(Debug, Clone)]
pub struct PythonBackend {
    python_bin: PathBuf,
    script: PathBuf,
}

impl PythonBackend {
    pub fn new(python_bin: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            python_bin: python_bin.into(),
            script: script.into(),
        }
    }
}

impl Backend for PythonBackend {
    fn open_training(
        &self,
        ctx: SessionContext,
        spec: &TrainingSpec,
        pretrained_weight: Option<&Path>,
    ) -> Result<Box<dyn TrainingSession>, BackendError> {
        let mut process = TrainerProcess::spawn(&self.python_bin, &self.script, ctx)?;
        let opened: Opened = process.call(&Request::OpenTraining {
            job_id: ctx.job_id,
            spec,
            pretrained_weight,
        })?;
        tracing::debug!(
            job_id = %ctx.job_id,
            device = ctx.device,
            batches = opened.batch_count,
            "Training session opened",
        );
        Ok(Box::new(PythonTrainingSession {
            process,
            batch_count: opened.batch_count,
        }))
    }

    fn open_prediction(
        &self,
        ctx: SessionContext,
        spec: &PredictionSpec,
        weight: &Path,
    ) -> Result<Box<dyn PredictionSession>, BackendError> {
        let mut process = TrainerProcess::spawn(&self.python_bin, &self.script, ctx)?;
        let opened: Opened = process.call(&Request::OpenPrediction {
            job_id: ctx.job_id,
            spec,
            weight,
        })?;
        Ok(Box::new(PythonPredictionSession {
            process,
            batch_count: opened.batch_count,
        }))
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    OpenTraining {
        job_id: JobId,
        spec: &'a TrainingSpec,
        pretrained_weight: Option<&'a Path>,
    },
    TrainBatch {
        index: u64,
    },
    Validate,
    SaveWeights {
        path: &'a Path,
    },
    OpenPrediction {
        job_id: JobId,
        spec: &'a PredictionSpec,
        weight: &'a Path,
    },
    PredictBatch {
        index: u64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Message<T> {
    Log { level: String, message: String },
    Result { data: T },
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct Opened {
    batch_count: u64,
}

/// Parse one stdout line. `Ok(None)` for lines that carry no reply.
fn parse_line<T: DeserializeOwned>(line: &str) -> Result<Option<T>, BackendError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Message<T>>(line) {
        Ok(Message::Result { data }) => Ok(Some(data)),
        Ok(Message::Error { message }) => Err(BackendError::Failed(message)),
        Ok(Message::Log { level, message }) => {
            tracing::debug!(level = %level, "trainer: {message}");
            Ok(None)
        }
        Err(e) if line.starts_with('{') => Err(BackendError::Protocol(e.to_string())),
        Err(_) => {
            tracing::debug!("trainer stdout: {line}");
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

struct TrainerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl TrainerProcess {
    fn spawn(python_bin: &Path, script: &Path, ctx: SessionContext) -> Result<Self, BackendError> {
        let mut child = Command::new(python_bin)
            .arg(script)
            .env("CUDA_VISIBLE_DEVICES", ctx.device.to_string())
            .env("TRAINYARD_JOB_ID", ctx.job_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(BackendError::Spawn)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(BackendError::Protocol("trainer stdio not captured".into()));
        };

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn call<T: DeserializeOwned>(&mut self, request: &Request<'_>) -> Result<T, BackendError> {
        let mut payload =
            serde_json::to_vec(request).map_err(|e| BackendError::Protocol(e.to_string()))?;
        payload.push(b'\n');
        self.stdin.write_all(&payload)?;
        self.stdin.flush()?;

        let mut line = String::new();
        loop {
            line.clear();
            if self.stdout.read_line(&mut line)? == 0 {
                return Err(BackendError::Exited);
            }
            if let Some(reply) = parse_line(&line)? {
                return Ok(reply);
            }
        }
    }
}

impl Drop for TrainerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

struct PythonTrainingSession {
    process: TrainerProcess,
    batch_count: u64,
}

impl TrainingSession for PythonTrainingSession {
    fn batch_count(&self) -> u64 {
        self.batch_count
    }

    fn train_batch(&mut self, index: u64) -> Result<f64, BackendError> {
        self.process.call(&Request::TrainBatch { index })
    }

    fn validate(&mut self) -> Result<ValidationOutcome, BackendError> {
        self.process.call(&Request::Validate)
    }

    fn save_weights(&mut self, path: &Path) -> Result<(), BackendError> {
        self.process.call(&Request::SaveWeights { path })
    }
}

struct PythonPredictionSession {
    process: TrainerProcess,
    batch_count: u64,
}

impl PredictionSession for PythonPredictionSession {
    fn batch_count(&self) -> u64 {
        self.batch_count
    }

    fn predict_batch(&mut self, index: u64) -> Result<Vec<PredictedImage>, BackendError> {
        self.process.call(&Request::PredictBatch { index })
    }
}
