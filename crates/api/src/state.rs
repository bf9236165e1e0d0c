use std::sync::Arc;

use trainyard_engine::{JobScheduler, LongPollService, WeightProgressService};

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<JobScheduler>,
    pub long_poll: Arc<LongPollService>,
    pub weight_progress: Arc<WeightProgressService>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Build the polling services around `scheduler` using the poll
    /// settings from `config`.
    pub fn new(scheduler: Arc<JobScheduler>, config: ServerConfig) -> Self {
        Self {
            long_poll: Arc::new(LongPollService::new(
                Arc::clone(&scheduler),
                config.progress_poll,
            )),
            weight_progress: Arc::new(WeightProgressService::new(
                Arc::clone(&scheduler),
                config.weight_poll,
            )),
            scheduler,
            config: Arc::new(config),
        }
    }
}
