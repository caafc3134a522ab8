//! Asynchronous job launch on a bounded worker pool
//!
//! Submitting a job only creates its record; the pipeline runs on a spawned
//! task once a worker permit is available. Jobs that cannot start because
//! their interface is busy stay `QUEUED` until a later [`JobLauncher::drain_queued`]
//! picks them up. Launched tasks never spawn follow-up work themselves.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ExtractError, Result};
use crate::job::{JobRecord, JobStatus, NewJob, StatusMachine};
use crate::orchestrator::{JobOutcome, PipelineOrchestrator};

pub type JobHandle = JoinHandle<Result<JobOutcome>>;

/// A created job and, if it was launched right away, its task
pub struct Submission {
    pub job: JobRecord,
    pub handle: Option<JobHandle>,
}

/// What [`JobLauncher::recover`] did with interrupted jobs
#[derive(Default)]
pub struct Recovery {
    pub resumed: Vec<(Uuid, JobHandle)>,
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

#[derive(Clone)]
pub struct JobLauncher {
    inner: Arc<Inner>,
}

struct Inner {
    orchestrators: HashMap<String, Arc<PipelineOrchestrator>>,
    machine: StatusMachine,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl JobLauncher {
    pub fn new(
        machine: StatusMachine,
        pool_size: usize,
        orchestrators: impl IntoIterator<Item = PipelineOrchestrator>,
    ) -> Self {
        let orchestrators = orchestrators
            .into_iter()
            .map(|o| (o.interface().interface_type.clone(), Arc::new(o)))
            .collect();
        Self {
            inner: Arc::new(Inner {
                orchestrators,
                machine,
                permits: Arc::new(Semaphore::new(pool_size.max(1))),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn machine(&self) -> &StatusMachine {
        &self.inner.machine
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.inner.orchestrators.keys().map(String::as_str)
    }

    fn orchestrator(&self, interface_type: &str) -> Result<Arc<PipelineOrchestrator>> {
        self.inner
            .orchestrators
            .get(interface_type)
            .cloned()
            .ok_or_else(|| ExtractError::config(format!("unknown interface {interface_type}")))
    }

    /// Create a job for `interface_type` and launch it unless the interface
    /// already has a job processing
    pub async fn submit(&self, interface_type: &str, owner: &str) -> Result<Submission> {
        let orchestrator = self.orchestrator(interface_type)?;
        let interface = orchestrator.interface();
        let file_name = interface.render_file_name(Utc::now());
        let output_path = orchestrator.output_dir().join(&file_name);

        let store = self.inner.machine.store();
        let job = store
            .create(NewJob {
                interface_type: interface_type.to_string(),
                file_name,
                output_path,
                owner: owner.to_string(),
            })
            .await?;
        info!(job_id = %job.id, interface = interface_type, owner, "Job created");

        if store.exists_running(interface_type).await? {
            let job = self
                .inner
                .machine
                .transition(job.id, JobStatus::Queued, None)
                .await?;
            info!(job_id = %job.id, "Interface busy, job queued");
            return Ok(Submission { job, handle: None });
        }

        let handle = self.launch(&job).await?;
        Ok(Submission { job, handle })
    }

    /// Launch every waiting job whose interface is idle, oldest first
    pub async fn drain_queued(&self) -> Result<Vec<(Uuid, JobHandle)>> {
        let store = self.inner.machine.store();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut launched = Vec::new();

        for job in store.find_pending().await? {
            if claimed.contains(&job.interface_type) {
                continue;
            }
            if !self.inner.orchestrators.contains_key(&job.interface_type) {
                warn!(job_id = %job.id, interface = %job.interface_type, "No pipeline for interface");
                continue;
            }
            if store.exists_running(&job.interface_type).await? {
                continue;
            }
            if let Some(handle) = self.launch(&job).await? {
                claimed.insert(job.interface_type.clone());
                launched.push((job.id, handle));
            }
        }
        Ok(launched)
    }

    /// Relaunch a stopped or waiting job
    pub async fn resume(&self, job_id: Uuid) -> Result<Option<JobHandle>> {
        let job = self.inner.machine.load(job_id).await?;
        match job.status {
            JobStatus::Stopped | JobStatus::Pending | JobStatus::Queued => self.launch(&job).await,
            status if status.is_terminal() => Err(ExtractError::TerminalState { job_id, status }),
            from => Err(ExtractError::IllegalTransition {
                job_id,
                from,
                to: JobStatus::Processing,
            }),
        }
    }

    /// Request a stop; the running pipeline honours it at the next chunk
    pub async fn stop(&self, job_id: Uuid) -> Result<JobRecord> {
        self.inner
            .machine
            .transition(job_id, JobStatus::Stopped, Some("stopped on request".to_string()))
            .await
    }

    /// Resolve jobs left in flight by a previous process.
    ///
    /// `PROCESSING` jobs are stopped and resumed from their checkpoint.
    /// `FINALIZING` jobs are completed if their artifact verifies and failed
    /// otherwise.
    pub async fn recover(&self) -> Result<Recovery> {
        let store = self.inner.machine.store();
        let mut recovery = Recovery::default();

        for job in store.find_by_status(JobStatus::Finalizing).await? {
            if self.inner.in_flight.lock().await.contains(&job.id) {
                continue;
            }
            let orchestrator = self.orchestrator(&job.interface_type)?;
            match orchestrator.recover_finalizing(&job).await? {
                JobOutcome::Completed { .. } => recovery.completed.push(job.id),
                _ => recovery.failed.push(job.id),
            }
        }

        for job in store.find_by_status(JobStatus::Processing).await? {
            if self.inner.in_flight.lock().await.contains(&job.id) {
                continue;
            }
            info!(job_id = %job.id, "Recovering interrupted job");
            let job = self
                .inner
                .machine
                .transition(
                    job.id,
                    JobStatus::Stopped,
                    Some("interrupted; resuming from checkpoint".to_string()),
                )
                .await?;
            if let Some(handle) = self.launch(&job).await? {
                recovery.resumed.push((job.id, handle));
            }
        }

        Ok(recovery)
    }

    /// Spawn the pipeline for `job` unless it is already in flight here
    async fn launch(&self, job: &JobRecord) -> Result<Option<JobHandle>> {
        let orchestrator = self.orchestrator(&job.interface_type)?;
        if !self.inner.in_flight.lock().await.insert(job.id) {
            return Ok(None);
        }

        let inner = Arc::clone(&self.inner);
        let job_id = job.id;
        let handle = tokio::spawn(async move {
            let permit = Arc::clone(&inner.permits).acquire_owned().await;
            let result = match permit {
                Ok(_permit) => orchestrator.run(job_id).await,
                Err(e) => Err(ExtractError::Store(format!("worker pool closed: {e}"))),
            };
            inner.in_flight.lock().await.remove(&job_id);

            match &result {
                Ok(outcome) => info!(job_id = %job_id, outcome = ?outcome, "Job task finished"),
                Err(e) => error!(job_id = %job_id, error = %e, "Job task failed"),
            }
            result
        });
        Ok(Some(handle))
    }
}
