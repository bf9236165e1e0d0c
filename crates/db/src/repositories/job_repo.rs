//! Repository for the `jobs` table.
//!
//! Uses `JobStatus` from `models::status` for every status literal.

use sqlx::PgPool;
use trainyard_core::job_spec::JobSpec;
use uuid::Uuid;

use crate::models::job::JobRow;
use crate::models::status::JobStatus;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, kind, spec, status_id, error_message, \
    best_epoch, best_weight, created_at, updated_at";

pub struct JobRepo;

impl JobRepo {
    /// Insert a newly admitted job in `reserved` status.
    pub async fn insert(
        pool: &PgPool,
        id: Uuid,
        spec: &JobSpec,
    ) -> Result<JobRow, sqlx::Error> {
        let spec_json = serde_json::to_value(spec)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let query = format!(
            "INSERT INTO jobs (id, kind, spec, status_id) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(spec.kind().as_str())
            .bind(spec_json)
            .bind(JobStatus::Reserved.id())
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Update a job's status. A deleted job is never resurrected, and the
    /// first recorded error message is kept.
    ///
    /// Returns `false` if no row exists for `id`.
    pub async fn update_status(
        pool: &PgPool,
        id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = CASE WHEN status_id = $4 THEN status_id ELSE $2 END, \
                 error_message = COALESCE(error_message, $3), \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.id())
        .bind(error_message)
        .bind(JobStatus::Deleted.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clear the best-weight column, returning the file name it held.
    pub async fn take_best_weight(
        pool: &PgPool,
        id: Uuid,
    ) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "UPDATE jobs AS j \
             SET best_weight = NULL, updated_at = NOW() \
             FROM (SELECT id, best_weight FROM jobs WHERE id = $1 FOR UPDATE) AS prev \
             WHERE j.id = prev.id \
             RETURNING prev.best_weight",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row.and_then(|(file,)| file))
    }
}
