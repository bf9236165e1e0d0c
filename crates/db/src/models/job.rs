//! Row model for the `jobs` table.

use serde::Serialize;
use sqlx::FromRow;
use trainyard_core::job_spec::JobSpec;
use trainyard_core::store::{JobRecord, StoreError};
use trainyard_core::types::{JobId, JobKind, Timestamp};
use uuid::Uuid;

use super::status::{JobStatus, StatusId};

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRow {
    pub id: Uuid,
    pub kind: String,
    pub spec: serde_json::Value,
    pub status_id: StatusId,
    pub error_message: Option<String>,
    pub best_epoch: Option<i32>,
    pub best_weight: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = JobId::from_uuid(row.id);
        let corrupt = |what: String| StoreError::Corrupt(format!("job {id}: {what}"));

        let kind: JobKind = row.kind.parse().map_err(corrupt)?;
        let spec: JobSpec = serde_json::from_value(row.spec)
            .map_err(|e| corrupt(format!("unreadable spec: {e}")))?;
        if spec.kind() != kind {
            return Err(corrupt(format!(
                "kind column is {kind} but spec is {}",
                spec.kind()
            )));
        }
        let state = JobStatus::from_id(row.status_id)
            .ok_or_else(|| corrupt(format!("unknown status id {}", row.status_id)))?
            .into();
        let best_epoch = row
            .best_epoch
            .map(u32::try_from)
            .transpose()
            .map_err(|_| corrupt("negative best_epoch".into()))?;

        Ok(JobRecord {
            id,
            kind,
            spec,
            state,
            error_message: row.error_message,
            best_epoch,
            best_weight: row.best_weight,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
