//! Durable job records and the store contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::JobStatus;
use crate::error::{ExtractError, Result};

/// One generation request for an interface file (maps to `bif_jobs`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub interface_type: String,
    pub file_name: String,
    /// Final artifact path; the provisional file lives next to it
    pub output_path: PathBuf,
    pub owner: String,
    pub status: JobStatus,
    pub records_processed: u64,
    pub records_skipped: u64,
    pub records_invalid: u64,
    pub records_filtered: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub interface_type: String,
    pub file_name: String,
    pub output_path: PathBuf,
    pub owner: String,
}

/// Compare-and-swap status change
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub job_id: Uuid,
    pub expected_version: i64,
    pub status: JobStatus,
    /// Replaces the stored message; `None` clears it
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Running counters published after every chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub processed: u64,
    pub skipped: u64,
    pub invalid: u64,
    pub filtered: u64,
}

impl JobRecord {
    pub fn new(job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            interface_type: job.interface_type,
            file_name: job.file_name,
            output_path: job.output_path,
            owner: job.owner,
            status: JobStatus::Pending,
            records_processed: 0,
            records_skipped: 0,
            records_invalid: 0,
            records_filtered: 0,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    pub fn metrics(&self) -> JobMetrics {
        JobMetrics {
            processed: self.records_processed,
            skipped: self.records_skipped,
            invalid: self.records_invalid,
            filtered: self.records_filtered,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: NewJob) -> Result<JobRecord>;

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>>;

    /// Apply `update` only if the stored version still matches.
    ///
    /// Returns the number of rows changed: `0` means another writer won the
    /// race. Moving a job into `PROCESSING` while another job of the same
    /// interface is processing fails with [`ExtractError::AlreadyRunning`].
    async fn update_status(&self, update: StatusUpdate) -> Result<u64>;

    /// Progress counters; does not take part in version checks
    async fn update_metrics(&self, job_id: Uuid, metrics: JobMetrics) -> Result<()>;

    /// Jobs waiting for a worker, oldest first
    async fn find_pending(&self) -> Result<Vec<JobRecord>>;

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>>;

    async fn exists_running(&self, interface_type: &str) -> Result<bool>;
}

/// Process-local job store for tests and single-run CLI invocations
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: NewJob) -> Result<JobRecord> {
        let record = JobRecord::new(job, Utc::now());
        self.jobs.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<u64> {
        let mut jobs = self.jobs.write().await;

        let (interface_type, current_version) = match jobs.get(&update.job_id) {
            Some(job) => (job.interface_type.clone(), job.version),
            None => return Err(ExtractError::JobNotFound(update.job_id)),
        };
        if current_version != update.expected_version {
            return Ok(0);
        }

        if update.status == JobStatus::Processing {
            let conflict = jobs.values().any(|other| {
                other.id != update.job_id
                    && other.interface_type == interface_type
                    && other.status == JobStatus::Processing
            });
            if conflict {
                return Err(ExtractError::AlreadyRunning(interface_type));
            }
        }

        let job = jobs
            .get_mut(&update.job_id)
            .ok_or(ExtractError::JobNotFound(update.job_id))?;
        if update.status == JobStatus::Processing && job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        job.status = update.status;
        job.error_message = update.error_message;
        if update.completed_at.is_some() {
            job.completed_at = update.completed_at;
        }
        job.version += 1;
        Ok(1)
    }

    async fn update_metrics(&self, job_id: Uuid, metrics: JobMetrics) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(ExtractError::JobNotFound(job_id))?;
        job.records_processed = metrics.processed;
        job.records_skipped = metrics.skipped;
        job.records_invalid = metrics.invalid;
        job.records_filtered = metrics.filtered;
        Ok(())
    }

    async fn find_pending(&self) -> Result<Vec<JobRecord>> {
        let mut pending: Vec<JobRecord> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status.is_launchable())
            .cloned()
            .collect();
        pending.sort_by_key(|job| job.created_at);
        Ok(pending)
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        let mut jobs: Vec<JobRecord> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn exists_running(&self, interface_type: &str) -> Result<bool> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .any(|job| job.interface_type == interface_type && job.status == JobStatus::Processing))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn new_job(interface_type: &str) -> NewJob {
        NewJob {
            interface_type: interface_type.to_string(),
            file_name: format!("{interface_type}.xml"),
            output_path: PathBuf::from(format!("/tmp/{interface_type}.xml")),
            owner: "tests".to_string(),
        }
    }

    fn to(job: &JobRecord, status: JobStatus) -> StatusUpdate {
        StatusUpdate {
            job_id: job.id,
            expected_version: job.version,
            status,
            error_message: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_stale_version_changes_nothing() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job("ACCOUNTS")).await.unwrap();

        assert_eq!(store.update_status(to(&job, JobStatus::Queued)).await.unwrap(), 1);
        assert_eq!(store.update_status(to(&job, JobStatus::Processing)).await.unwrap(), 0);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_second_processing_job_rejected() {
        let store = InMemoryJobStore::new();
        let first = store.create(new_job("ACCOUNTS")).await.unwrap();
        let second = store.create(new_job("ACCOUNTS")).await.unwrap();
        let other = store.create(new_job("ORDERS")).await.unwrap();

        store.update_status(to(&first, JobStatus::Processing)).await.unwrap();
        let err = store
            .update_status(to(&second, JobStatus::Processing))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::AlreadyRunning(ref t) if t == "ACCOUNTS"));

        assert_eq!(store.update_status(to(&other, JobStatus::Processing)).await.unwrap(), 1);
        assert!(store.exists_running("ACCOUNTS").await.unwrap());
    }

    #[tokio::test]
    async fn test_metrics_do_not_bump_version() {
        let store = InMemoryJobStore::new();
        let job = store.create(new_job("ACCOUNTS")).await.unwrap();
        let metrics = JobMetrics {
            processed: 10,
            skipped: 1,
            invalid: 2,
            filtered: 3,
        };
        store.update_metrics(job.id, metrics).await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.metrics(), metrics);
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn test_find_pending_includes_queued() {
        let store = InMemoryJobStore::new();
        let a = store.create(new_job("A")).await.unwrap();
        let b = store.create(new_job("B")).await.unwrap();
        store.update_status(to(&b, JobStatus::Queued)).await.unwrap();
        let c = store.create(new_job("C")).await.unwrap();
        store.update_status(to(&c, JobStatus::Failed)).await.unwrap();

        let ids: Vec<Uuid> = store.find_pending().await.unwrap().iter().map(|j| j.id).collect();
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
        assert!(!ids.contains(&c.id));
    }
}
