//! PostgreSQL implementation of [`JobStore`].

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use trainyard_core::job_spec::JobSpec;
use trainyard_core::lifecycle::JobState;
use trainyard_core::store::{EpochSummary, JobRecord, JobStore, StoreError};
use trainyard_core::types::JobId;

use crate::repositories::{EpochRepo, JobRepo};
use crate::DbPool;

pub struct PgJobStore {
    pool: DbPool,
    trained_weight_dir: PathBuf,
}

impl PgJobStore {
    /// `trained_weight_dir` is where training jobs write their best-epoch
    /// weights; `delete_weight_file` removes files from there.
    pub fn new(pool: DbPool, trained_weight_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            trained_weight_dir: trained_weight_dir.into(),
        }
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Remove `file` from `dir`. A missing file is not an error.
async fn remove_weight(dir: &Path, file: &str) -> Result<bool, io::Error> {
    match tokio::fs::remove_file(dir.join(file)).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn register_job(&self, id: JobId, spec: &JobSpec) -> Result<(), StoreError> {
        JobRepo::insert(&self.pool, id.as_uuid(), spec)
            .await
            .map_err(unavailable)?;
        tracing::debug!(job_id = %id, kind = %spec.kind(), "Job registered");
        Ok(())
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        JobRepo::find_by_id(&self.pool, id.as_uuid())
            .await
            .map_err(unavailable)?
            .map(JobRecord::try_from)
            .transpose()
    }

    async fn save_job_state(
        &self,
        id: JobId,
        state: JobState,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let found = JobRepo::update_status(&self.pool, id.as_uuid(), state.into(), error_message)
            .await
            .map_err(unavailable)?;
        if !found {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn save_epoch(&self, epoch: &EpochSummary) -> Result<(), StoreError> {
        let found = EpochRepo::insert(&self.pool, epoch)
            .await
            .map_err(unavailable)?;
        if !found {
            return Err(StoreError::NotFound(epoch.job_id));
        }
        Ok(())
    }

    async fn delete_weight_file(&self, id: JobId) -> Result<(), StoreError> {
        let Some(file) = JobRepo::take_best_weight(&self.pool, id.as_uuid())
            .await
            .map_err(unavailable)?
        else {
            return Ok(());
        };

        let removed = remove_weight(&self.trained_weight_dir, &file).await?;
        tracing::info!(job_id = %id, file = %file, removed, "Trained weight deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use assert_matches::assert_matches;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn remove_weight_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_model.h5");
        tokio::fs::write(&path, b"weights").await.unwrap();

        assert!(remove_weight(dir.path(), "best_model.h5").await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn remove_weight_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!remove_weight(dir.path(), "absent.h5").await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_database_is_unavailable() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(500))
            .connect_lazy("postgres://trainyard@127.0.0.1:1/trainyard")
            .unwrap();
        let store = PgJobStore::new(pool, "/nonexistent");

        let res = store.fetch_job(JobId::new()).await;
        assert_matches!(res, Err(StoreError::Unavailable(_)));
    }
}
