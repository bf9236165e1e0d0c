pub mod detection;
pub mod error;
pub mod job_spec;
pub mod lifecycle;
pub mod progress;
pub mod store;
pub mod types;
pub mod weight;
