//! Pretrained-weight acquisition sub-state.
//!
//! `Checking -> Downloading -> Exists`, or `Checking -> Exists` when the
//! file is already cached. `Exists` is terminal. While downloading, the
//! percentage never decreases.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightState {
    Checking,
    Downloading,
    Exists,
}

impl WeightState {
    pub fn as_str(self) -> &'static str {
        match self {
            WeightState::Checking => "checking",
            WeightState::Downloading => "downloading",
            WeightState::Exists => "exists",
        }
    }
}

impl fmt::Display for WeightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid weight transition: {from} -> {to}")]
pub struct WeightTransitionError {
    pub from: WeightState,
    pub to: WeightState,
}

/// Current weight acquisition state and download percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WeightStatus {
    state: WeightState,
    percentage: u8,
}

impl Default for WeightStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightStatus {
    pub fn new() -> Self {
        Self {
            state: WeightState::Checking,
            percentage: 0,
        }
    }

    pub fn state(&self) -> WeightState {
        self.state
    }

    /// Download percentage; always 100 once the weight exists.
    pub fn percentage(&self) -> u8 {
        match self.state {
            WeightState::Exists => 100,
            _ => self.percentage,
        }
    }

    pub fn begin_download(&mut self) -> Result<(), WeightTransitionError> {
        match self.state {
            WeightState::Checking => {
                self.state = WeightState::Downloading;
                self.percentage = 0;
                Ok(())
            }
            from => Err(WeightTransitionError {
                from,
                to: WeightState::Downloading,
            }),
        }
    }

    /// Report download progress. Lower values than already reported are
    /// ignored; reaching 100 completes the acquisition.
    pub fn report(&mut self, percentage: u8) -> Result<(), WeightTransitionError> {
        if self.state != WeightState::Downloading {
            return Err(WeightTransitionError {
                from: self.state,
                to: WeightState::Downloading,
            });
        }
        self.percentage = self.percentage.max(percentage.min(100));
        if self.percentage == 100 {
            self.state = WeightState::Exists;
        }
        Ok(())
    }

    pub fn mark_exists(&mut self) -> Result<(), WeightTransitionError> {
        match self.state {
            WeightState::Checking | WeightState::Downloading => {
                self.state = WeightState::Exists;
                self.percentage = 100;
                Ok(())
            }
            WeightState::Exists => Err(WeightTransitionError {
                from: WeightState::Exists,
                to: WeightState::Exists,
            }),
        }
    }
}
