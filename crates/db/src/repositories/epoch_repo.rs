//! Repository for the `job_epochs` table.

use sqlx::PgPool;
use trainyard_core::store::EpochSummary;

pub struct EpochRepo;

impl EpochRepo {
    /// Record one epoch. When the epoch carries a weight file it becomes
    /// the job's best weight, in the same transaction.
    ///
    /// Returns `false` if the job row does not exist.
    pub async fn insert(pool: &PgPool, epoch: &EpochSummary) -> Result<bool, sqlx::Error> {
        let job_id = epoch.job_id.as_uuid();
        let epoch_no = i32::try_from(epoch.epoch)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let mut tx = pool.begin().await?;

        let exists: Option<(uuid::Uuid,)> =
            sqlx::query_as("SELECT id FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO job_epochs \
                 (job_id, epoch, train_loss, valid_loss, valid_iou, valid_map, weight_file) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (job_id, epoch) DO UPDATE SET \
                 train_loss = EXCLUDED.train_loss, \
                 valid_loss = EXCLUDED.valid_loss, \
                 valid_iou = EXCLUDED.valid_iou, \
                 valid_map = EXCLUDED.valid_map, \
                 weight_file = EXCLUDED.weight_file",
        )
        .bind(job_id)
        .bind(epoch_no)
        .bind(epoch.train_loss)
        .bind(epoch.valid_loss)
        .bind(epoch.valid_iou)
        .bind(epoch.valid_map)
        .bind(&epoch.weight_file)
        .execute(&mut *tx)
        .await?;

        if let Some(file) = &epoch.weight_file {
            sqlx::query(
                "UPDATE jobs SET best_epoch = $2, best_weight = $3, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(epoch_no)
            .bind(file)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}
