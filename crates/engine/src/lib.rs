//! Job execution engine: admission control over a fixed set of device
//! slots, worker execution, cooperative cancellation and the long-poll
//! status services.

pub mod backend;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod job;
pub mod long_poll;
pub mod memory;
pub mod scheduler;
pub mod weight_progress;

mod sync;
mod worker;

pub use cancellation::CancellationController;
pub use config::{PollConfig, SchedulerConfig};
pub use error::EngineError;
pub use job::{Job, JobObservation};
pub use long_poll::{LastKnown, LongPollService, PollOutcome, StatusReport};
pub use scheduler::{JobScheduler, JobSummary, SchedulerSummary};
pub use weight_progress::WeightProgressService;
