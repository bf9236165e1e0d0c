//! In-process [`JobStore`] for tests and embedders that run without a
//! database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use trainyard_core::job_spec::JobSpec;
use trainyard_core::lifecycle::JobState;
use trainyard_core::store::{EpochSummary, JobRecord, JobStore, StoreError};
use trainyard_core::types::JobId;

use crate::sync::lock;

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, JobRecord>,
    epochs: Vec<EpochSummary>,
    weight_deletions: HashMap<JobId, usize>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn insert(&self, record: JobRecord) {
        lock(&self.tables).jobs.insert(record.id, record);
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        lock(&self.tables).jobs.get(&id).cloned()
    }

    /// Every stored job record, in no particular order.
    pub fn records(&self) -> Vec<JobRecord> {
        lock(&self.tables).jobs.values().cloned().collect()
    }

    pub fn epochs(&self, id: JobId) -> Vec<EpochSummary> {
        lock(&self.tables)
            .epochs
            .iter()
            .filter(|e| e.job_id == id)
            .cloned()
            .collect()
    }

    /// How many times `delete_weight_file` was called for `id`.
    pub fn weight_deletions(&self, id: JobId) -> usize {
        lock(&self.tables)
            .weight_deletions
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn register_job(&self, id: JobId, spec: &JobSpec) -> Result<(), StoreError> {
        self.check()?;
        let now = chrono::Utc::now();
        self.insert(JobRecord {
            id,
            kind: spec.kind(),
            spec: spec.clone(),
            state: JobState::Reserved,
            error_message: None,
            best_epoch: None,
            best_weight: None,
            created_at: now,
            updated_at: now,
        });
        Ok(())
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.check()?;
        Ok(self.get(id))
    }

    async fn save_job_state(
        &self,
        id: JobId,
        state: JobState,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = lock(&self.tables);
        let record = tables.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if record.state == JobState::Deleted {
            return Ok(());
        }
        record.state = state;
        if record.error_message.is_none() {
            record.error_message = error_message.map(str::to_string);
        }
        record.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn save_epoch(&self, epoch: &EpochSummary) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = lock(&self.tables);
        let record = tables
            .jobs
            .get_mut(&epoch.job_id)
            .ok_or(StoreError::NotFound(epoch.job_id))?;
        if let Some(file) = &epoch.weight_file {
            record.best_epoch = Some(epoch.epoch);
            record.best_weight = Some(file.clone());
        }
        tables.epochs.push(epoch.clone());
        Ok(())
    }

    async fn delete_weight_file(&self, id: JobId) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = lock(&self.tables);
        *tables.weight_deletions.entry(id).or_insert(0) += 1;
        if let Some(record) = tables.jobs.get_mut(&id) {
            record.best_weight = None;
        }
        Ok(())
    }
}
