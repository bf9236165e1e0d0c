pub mod epoch_repo;
pub mod job_repo;

pub use epoch_repo::EpochRepo;
pub use job_repo::JobRepo;
