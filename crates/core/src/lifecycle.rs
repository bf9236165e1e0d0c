//! Job lifecycle state machine and running sub-phase.
//!
//! [`JobState`] is a ratchet: transitions only move forward along the
//! table in [`JobState::valid_transitions`]. Once a job reaches
//! `Stopping` the only exits are `Finished` (worker acknowledged the
//! cancellation) and `Deleted`; `Deleted` is reachable from every other
//! state and has no exits.
//!
//! [`Lifecycle`] is the single mutator for a job's state and error
//! message. Disallowed transitions are rejected with a [`TransitionError`]
//! rather than silently dropped, so callers can log them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Reserved,
    Running,
    Stopping,
    Finished,
    Deleted,
}

impl JobState {
    /// Returns the set of states reachable from `self`.
    pub fn valid_transitions(self) -> &'static [JobState] {
        use JobState::*;
        match self {
            // Promotion, stop before start, delete.
            Reserved => &[Running, Finished, Deleted],
            // Stop signal, normal completion or failure, delete.
            Running => &[Stopping, Finished, Deleted],
            // Worker acknowledged cancellation, delete.
            Stopping => &[Finished, Deleted],
            Finished => &[Deleted],
            Deleted => &[],
        }
    }

    /// Check whether a transition from `self` to `to` is allowed.
    pub fn can_transition(self, to: JobState) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Reserved => "reserved",
            JobState::Running => "running",
            JobState::Stopping => "stopping",
            JobState::Finished => "finished",
            JobState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(JobState::Reserved),
            "running" => Ok(JobState::Running),
            "stopping" => Ok(JobState::Stopping),
            "finished" => Ok(JobState::Finished),
            "deleted" => Ok(JobState::Deleted),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// A transition that the state table does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

// ---------------------------------------------------------------------------
// RunningState
// ---------------------------------------------------------------------------

/// Fine-grained phase of a job's execution, published by its worker.
///
/// `Stopping` is never published by a worker. It is derived from the
/// lifecycle state by [`RunningState::effective`], which makes the
/// sub-phase ratchet follow the lifecycle ratchet automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningState {
    #[default]
    Starting,
    Training,
    Validating,
    Predicting,
    Stopping,
}

impl RunningState {
    /// The phase reported to clients for a job in `state` whose worker
    /// last published `published`.
    pub fn effective(state: JobState, published: RunningState) -> RunningState {
        match state {
            JobState::Stopping => RunningState::Stopping,
            _ => published,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunningState::Starting => "starting",
            RunningState::Training => "training",
            RunningState::Validating => "validating",
            RunningState::Predicting => "predicting",
            RunningState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunningState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(RunningState::Starting),
            "training" => Ok(RunningState::Training),
            "validating" => Ok(RunningState::Validating),
            "predicting" => Ok(RunningState::Predicting),
            "stopping" => Ok(RunningState::Stopping),
            other => Err(format!("unknown running state '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// A job's lifecycle state plus its (write-once) error message.
///
/// Invariant: `error_message.is_some()` implies `state == Finished`, or
/// `Deleted` after the failure was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: JobState,
    error_message: Option<String>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// A freshly submitted job.
    pub fn new() -> Self {
        Self {
            state: JobState::Reserved,
            error_message: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Move to `to` if the table allows it.
    pub fn transition(&mut self, to: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Record a worker failure: transition to `Finished` and set the
    /// error message. The first recorded message wins.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobState::Finished)?;
        if self.error_message.is_none() {
            self.error_message = Some(message.into());
        }
        Ok(())
    }
}
