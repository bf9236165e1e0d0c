use std::path::PathBuf;
use std::time::Duration;

/// Default bound on how long `stop`/`delete` wait for a worker to exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(600);

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of device slots, N. At most this many jobs run at once.
    pub slot_count: usize,
    /// How long `stop`/`delete` wait for the worker to acknowledge
    /// cancellation before reporting a stall.
    pub stop_timeout: Duration,
    /// Directory holding best-epoch weights written by training jobs.
    pub trained_weight_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slot_count: 1,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            trained_weight_dir: PathBuf::from("storage/trained"),
        }
    }
}

/// Iteration cap and interval of a polling endpoint.
///
/// A poll checks at most `max_wait_iterations` times, `poll_interval`
/// apart, so it blocks for roughly `max_wait_iterations * poll_interval`
/// before timing out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub max_wait_iterations: u32,
    pub poll_interval: Duration,
}

impl PollConfig {
    /// Progress long-poll: 1800 x 0.75s.
    pub fn progress() -> Self {
        Self {
            max_wait_iterations: 1800,
            poll_interval: Duration::from_millis(750),
        }
    }

    /// Weight download progress: 60 x 1s.
    pub fn weight() -> Self {
        Self {
            max_wait_iterations: 60,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Upper bound on how long a single poll blocks.
    pub fn window(&self) -> Duration {
        self.poll_interval * self.max_wait_iterations
    }
}
