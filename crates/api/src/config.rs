use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use trainyard_engine::config::DEFAULT_STOP_TIMEOUT;
use trainyard_engine::{PollConfig, SchedulerConfig};

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development. In production,
/// override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8080`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds. Must exceed the long-poll window.
    pub request_timeout_secs: u64,
    /// How long shutdown waits for running workers to exit.
    pub shutdown_timeout_secs: u64,
    /// Device slot count override. `None` means detect via NVML.
    pub gpu_count: Option<usize>,
    pub stop_timeout: Duration,
    pub progress_poll: PollConfig,
    pub weight_poll: PollConfig,
    pub pretrained_weight_dir: PathBuf,
    pub pretrained_weight_url: String,
    pub trained_weight_dir: PathBuf,
    pub python_bin: PathBuf,
    pub trainer_script: PathBuf,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                            |
    /// |-----------------------------|------------------------------------|
    /// | `HOST`                      | `0.0.0.0`                          |
    /// | `PORT`                      | `8080`                             |
    /// | `CORS_ORIGINS`              | `http://localhost:8080`            |
    /// | `REQUEST_TIMEOUT_SECS`      | `1500`                             |
    /// | `SHUTDOWN_TIMEOUT_SECS`     | `30`                               |
    /// | `GPU_COUNT`                 | detected via NVML, else 1          |
    /// | `STOP_TIMEOUT_SECS`         | `600`                              |
    /// | `PROGRESS_POLL_ITERATIONS`  | `1800`                             |
    /// | `PROGRESS_POLL_INTERVAL_MS` | `750`                              |
    /// | `WEIGHT_POLL_ITERATIONS`    | `60`                               |
    /// | `WEIGHT_POLL_INTERVAL_MS`   | `1000`                             |
    /// | `PRETRAINED_WEIGHT_DIR`     | `storage/pretrained`               |
    /// | `PRETRAINED_WEIGHT_URL`     | `https://example.invalid/weights`  |
    /// | `TRAINED_WEIGHT_DIR`        | `storage/trained`                  |
    /// | `PYTHON_BIN`                | `python3`                          |
    /// | `TRAINER_SCRIPT`            | `workers/trainer.py`               |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env_or("PORT", 8080);

        let cors_origins = parse_origins(
            &std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "http://localhost:8080".into()),
        );

        let progress_defaults = PollConfig::progress();
        let progress_poll = PollConfig {
            max_wait_iterations: env_or(
                "PROGRESS_POLL_ITERATIONS",
                progress_defaults.max_wait_iterations,
            ),
            poll_interval: Duration::from_millis(env_or(
                "PROGRESS_POLL_INTERVAL_MS",
                progress_defaults.poll_interval.as_millis() as u64,
            )),
        };

        let weight_defaults = PollConfig::weight();
        let weight_poll = PollConfig {
            max_wait_iterations: env_or(
                "WEIGHT_POLL_ITERATIONS",
                weight_defaults.max_wait_iterations,
            ),
            poll_interval: Duration::from_millis(env_or(
                "WEIGHT_POLL_INTERVAL_MS",
                weight_defaults.poll_interval.as_millis() as u64,
            )),
        };

        let gpu_count = std::env::var("GPU_COUNT").ok().map(|v| {
            v.parse::<usize>()
                .expect("GPU_COUNT must be a positive integer")
        });

        let config = Self {
            host,
            port,
            cors_origins,
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 1500),
            shutdown_timeout_secs: env_or("SHUTDOWN_TIMEOUT_SECS", 30),
            gpu_count,
            stop_timeout: Duration::from_secs(env_or(
                "STOP_TIMEOUT_SECS",
                DEFAULT_STOP_TIMEOUT.as_secs(),
            )),
            progress_poll,
            weight_poll,
            pretrained_weight_dir: env_or("PRETRAINED_WEIGHT_DIR", "storage/pretrained".into()),
            pretrained_weight_url: std::env::var("PRETRAINED_WEIGHT_URL")
                .unwrap_or_else(|_| "https://example.invalid/weights".into()),
            trained_weight_dir: env_or("TRAINED_WEIGHT_DIR", "storage/trained".into()),
            python_bin: env_or("PYTHON_BIN", "python3".into()),
            trainer_script: env_or("TRAINER_SCRIPT", "workers/trainer.py".into()),
        };
        if let Err(msg) = config.check_request_timeout() {
            panic!("{msg}");
        }
        config
    }

    /// The request timeout must outlast both long-poll windows, otherwise
    /// an idle poll is cut off with 408 before it can report a timeout.
    pub fn check_request_timeout(&self) -> Result<(), String> {
        let timeout = Duration::from_secs(self.request_timeout_secs);
        for (name, poll) in [("progress", self.progress_poll), ("weight", self.weight_poll)] {
            if timeout <= poll.window() {
                return Err(format!(
                    "REQUEST_TIMEOUT_SECS ({}s) must exceed the {name} poll window ({}s)",
                    self.request_timeout_secs,
                    poll.window().as_secs_f64()
                ));
            }
        }
        Ok(())
    }

    /// Scheduler settings for `slot_count` device slots.
    pub fn scheduler_config(&self, slot_count: usize) -> SchedulerConfig {
        SchedulerConfig {
            slot_count,
            stop_timeout: self.stop_timeout,
            trained_weight_dir: self.trained_weight_dir.clone(),
        }
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
///
/// Panics on an unparseable value; misconfiguration should fail at startup.
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|e| panic!("{key} has an invalid value '{raw}': {e}")),
        Err(_) => default,
    }
}

/// Split a comma-separated origin list, dropping blanks.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
