//! Validated, optimistically locked status transitions
//!
//! Every transition re-reads the job, checks it against the transition table
//! and then performs a compare-and-swap on the job version. Losing the race
//! triggers a fresh read, so a concurrent change is never overwritten blindly
//! and a transition that became illegal in the meantime is reported as such.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{JobRecord, JobStatus, JobStore, StatusUpdate};
use crate::error::{ExtractError, Result};

#[derive(Clone)]
pub struct StatusMachine {
    store: Arc<dyn JobStore>,
    max_attempts: u32,
}

impl StatusMachine {
    pub fn new(store: Arc<dyn JobStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn load(&self, job_id: Uuid) -> Result<JobRecord> {
        self.store
            .get(job_id)
            .await?
            .ok_or(ExtractError::JobNotFound(job_id))
    }

    /// Move `job_id` to `to`. A `FAILED` transition must carry a reason.
    /// Only `FAILED` and `STOPPED` keep a reason; any other transition
    /// clears the stored message.
    pub async fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<JobRecord> {
        let reason = match (to, reason) {
            (JobStatus::Failed, None) => {
                return Err(ExtractError::Store(format!(
                    "job {job_id}: a FAILED transition needs a reason"
                )))
            },
            (JobStatus::Failed | JobStatus::Stopped, reason) => reason,
            (_, _) => None,
        };

        for attempt in 1..=self.max_attempts {
            let current = self.load(job_id).await?;
            Self::check(&current, to)?;

            let completed_at = to.is_terminal().then(Utc::now);
            let update = StatusUpdate {
                job_id,
                expected_version: current.version,
                status: to,
                error_message: reason.clone(),
                completed_at,
            };

            if self.store.update_status(update).await? == 1 {
                info!(
                    job_id = %job_id,
                    from = %current.status,
                    to = %to,
                    "Job status changed"
                );
                return self.load(job_id).await;
            }

            debug!(
                job_id = %job_id,
                attempt,
                expected_version = current.version,
                "Version conflict on status update, re-reading"
            );
        }

        let latest = self.load(job_id).await?;
        warn!(job_id = %job_id, to = %to, "Giving up on status update after repeated conflicts");
        Err(ExtractError::VersionConflict {
            job_id,
            expected_version: latest.version,
        })
    }

    fn check(current: &JobRecord, to: JobStatus) -> Result<()> {
        if current.status.is_terminal() {
            return Err(ExtractError::TerminalState {
                job_id: current.id,
                status: current.status,
            });
        }
        if !current.status.can_transition_to(to) {
            return Err(ExtractError::IllegalTransition {
                job_id: current.id,
                from: current.status,
                to,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::job::{InMemoryJobStore, JobMetrics, NewJob};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn new_job() -> NewJob {
        NewJob {
            interface_type: "ACCOUNTS".to_string(),
            file_name: "ACCOUNTS.xml".to_string(),
            output_path: PathBuf::from("/tmp/ACCOUNTS.xml"),
            owner: "tests".to_string(),
        }
    }

    #[tokio::test]
    async fn test_happy_path() {
        let store = Arc::new(InMemoryJobStore::new());
        let machine = StatusMachine::new(store.clone(), 3);
        let job = store.create(new_job()).await.unwrap();

        machine.transition(job.id, JobStatus::Processing, None).await.unwrap();
        machine.transition(job.id, JobStatus::Finalizing, None).await.unwrap();
        let done = machine.transition(job.id, JobStatus::Completed, None).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.started_at.is_some());
        assert_eq!(done.version, 3);
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let store = Arc::new(InMemoryJobStore::new());
        let machine = StatusMachine::new(store.clone(), 3);
        let job = store.create(new_job()).await.unwrap();
        machine
            .transition(job.id, JobStatus::Failed, Some("boom".into()))
            .await
            .unwrap();

        let err = machine
            .transition(job.id, JobStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::TerminalState { status: JobStatus::Failed, .. }));

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_state() {
        let store = Arc::new(InMemoryJobStore::new());
        let machine = StatusMachine::new(store.clone(), 3);
        let job = store.create(new_job()).await.unwrap();

        let err = machine
            .transition(job.id, JobStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::IllegalTransition { .. }));
        assert_eq!(store.get(job.id).await.unwrap().unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_failed_requires_reason() {
        let store = Arc::new(InMemoryJobStore::new());
        let machine = StatusMachine::new(store.clone(), 3);
        let job = store.create(new_job()).await.unwrap();
        assert!(machine.transition(job.id, JobStatus::Failed, None).await.is_err());
    }

    #[tokio::test]
    async fn test_resumed_job_drops_stop_reason() {
        let store = Arc::new(InMemoryJobStore::new());
        let machine = StatusMachine::new(store.clone(), 3);
        let job = store.create(new_job()).await.unwrap();

        machine.transition(job.id, JobStatus::Processing, None).await.unwrap();
        let stopped = machine
            .transition(job.id, JobStatus::Stopped, Some("stopped on request".into()))
            .await
            .unwrap();
        assert_eq!(stopped.error_message.as_deref(), Some("stopped on request"));

        machine.transition(job.id, JobStatus::Processing, None).await.unwrap();
        machine.transition(job.id, JobStatus::Finalizing, None).await.unwrap();
        let done = machine
            .transition(job.id, JobStatus::Completed, Some("ignored".into()))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.error_message.is_none());
    }

    /// Store that loses the version race a fixed number of times
    struct ContendedStore {
        inner: InMemoryJobStore,
        conflicts: AtomicU32,
    }

    #[async_trait]
    impl JobStore for ContendedStore {
        async fn create(&self, job: NewJob) -> Result<JobRecord> {
            self.inner.create(job).await
        }
        async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
            self.inner.get(job_id).await
        }
        async fn update_status(&self, update: StatusUpdate) -> Result<u64> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Ok(0);
            }
            self.inner.update_status(update).await
        }
        async fn update_metrics(&self, job_id: Uuid, metrics: JobMetrics) -> Result<()> {
            self.inner.update_metrics(job_id, metrics).await
        }
        async fn find_pending(&self) -> Result<Vec<JobRecord>> {
            self.inner.find_pending().await
        }
        async fn find_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
            self.inner.find_by_status(status).await
        }
        async fn exists_running(&self, interface_type: &str) -> Result<bool> {
            self.inner.exists_running(interface_type).await
        }
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_then_reported() {
        let store = Arc::new(ContendedStore {
            inner: InMemoryJobStore::new(),
            conflicts: AtomicU32::new(2),
        });
        let machine = StatusMachine::new(store.clone(), 3);
        let job = store.create(new_job()).await.unwrap();

        let moved = machine.transition(job.id, JobStatus::Queued, None).await.unwrap();
        assert_eq!(moved.status, JobStatus::Queued);

        store.conflicts.store(5, Ordering::SeqCst);
        let err = machine
            .transition(job.id, JobStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::VersionConflict { .. }));
    }
}
