//! Runs one job end to end: extract, finalize, complete
//!
//! The extract step loops over chunks: read, process, write, checkpoint,
//! persist. The job status is checked between chunks so an external stop
//! takes effect at the next chunk boundary, leaving a resumable provisional
//! file and checkpoint behind. Once the reader is exhausted the file is
//! closed with its footer, renamed to its final name, checksummed and
//! verified before the job is marked `COMPLETED`.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::checkpoint::{
    CheckpointStore, Checkpointable, OutcomeCounts, StepCheckpoint, EXTRACT_STEP,
};
use crate::error::{ExtractError, Result};
use crate::finalizer::{provisional_path, Finalizer};
use crate::interface::{EncodingConfig, InterfaceConfig};
use crate::job::{JobMetrics, JobRecord, JobStatus, StatusMachine};
use crate::processor::{Outcome, RecordProcessor};
use crate::reader::CursorReader;
use crate::schema::{RecordSchema, SchemaCache};
use crate::source::RecordSource;
use crate::validator::ContentValidator;
use crate::writer::{encoder_for, CheckpointedWriter, FieldMapping};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        final_path: PathBuf,
        digest: String,
        records_written: u64,
        metrics: JobMetrics,
    },
    /// Stopped externally; resumable from the last checkpoint
    Stopped { records_read: u64 },
    Failed { reason: String },
    /// Another job of the interface is processing; this one was queued,
    /// stopped jobs included, and keeps its checkpoint
    Deferred,
}

enum StepEnd {
    Exhausted { records_written: u64, metrics: JobMetrics },
    Stopped { records_read: u64 },
}

pub struct PipelineOrchestrator {
    interface: Arc<InterfaceConfig>,
    source: Arc<dyn RecordSource>,
    machine: StatusMachine,
    checkpoints: Arc<dyn CheckpointStore>,
    finalizer: Finalizer,
    mappings: Arc<SchemaCache<FieldMapping>>,
    schemas: Arc<SchemaCache<RecordSchema>>,
}

impl PipelineOrchestrator {
    pub fn new(
        interface: Arc<InterfaceConfig>,
        source: Arc<dyn RecordSource>,
        machine: StatusMachine,
        checkpoints: Arc<dyn CheckpointStore>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interface,
            source,
            machine,
            checkpoints,
            finalizer: Finalizer::new(output_dir),
            mappings: Arc::new(SchemaCache::new()),
            schemas: Arc::new(SchemaCache::new()),
        }
    }

    /// Share parsed mappings and schemas with other orchestrators
    pub fn with_caches(
        mut self,
        mappings: Arc<SchemaCache<FieldMapping>>,
        schemas: Arc<SchemaCache<RecordSchema>>,
    ) -> Self {
        self.mappings = mappings;
        self.schemas = schemas;
        self
    }

    pub fn interface(&self) -> &InterfaceConfig {
        &self.interface
    }

    pub fn finalizer(&self) -> &Finalizer {
        &self.finalizer
    }

    pub fn output_dir(&self) -> &Path {
        self.finalizer.output_dir()
    }

    /// Run or resume `job_id`.
    ///
    /// Job-level failures are reported as [`JobOutcome::Failed`] after the job
    /// has been marked `FAILED`; an `Err` means the job store itself could not
    /// be updated.
    #[instrument(skip(self), fields(interface = %self.interface.interface_type))]
    pub async fn run(&self, job_id: Uuid) -> Result<JobOutcome> {
        let job = self.machine.load(job_id).await?;
        if job.interface_type != self.interface.interface_type {
            return Err(ExtractError::config(format!(
                "job {job_id} belongs to interface {}, not {}",
                job.interface_type, self.interface.interface_type
            )));
        }

        match self
            .machine
            .transition(job_id, JobStatus::Processing, None)
            .await
        {
            Ok(_) => {},
            Err(ExtractError::AlreadyRunning(interface)) => {
                // a stopped job re-enters the queue so a later drain resumes it
                if job.status == JobStatus::Stopped {
                    self.machine
                        .transition(job_id, JobStatus::Pending, None)
                        .await?;
                }
                if matches!(job.status, JobStatus::Pending | JobStatus::Stopped) {
                    self.machine
                        .transition(job_id, JobStatus::Queued, None)
                        .await?;
                }
                info!(job_id = %job_id, interface = %interface, "Interface busy, job queued");
                return Ok(JobOutcome::Deferred);
            },
            Err(e) => return Err(e),
        }
        info!(job_id = %job_id, file_name = %job.file_name, "Job started");

        match self.extract(&job).await {
            Ok(StepEnd::Stopped { records_read }) => {
                info!(job_id = %job_id, records_read, "Job stopped at chunk boundary");
                Ok(JobOutcome::Stopped { records_read })
            },
            Ok(StepEnd::Exhausted {
                records_written,
                metrics,
            }) => self.complete(&job, records_written, metrics).await,
            Err(e) => self.fail_or_stop(job_id, e).await,
        }
    }

    async fn extract(&self, job: &JobRecord) -> Result<StepEnd> {
        let provisional = provisional_path(&job.output_path);
        if let Some(dir) = job.output_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut checkpoint = self.checkpoints.load(job.id, EXTRACT_STEP).await?;
        if checkpoint.is_some() && !tokio::fs::try_exists(&provisional).await? {
            warn!(
                job_id = %job.id,
                path = %provisional.display(),
                "Checkpoint found but provisional file is gone; restarting from scratch"
            );
            self.checkpoints.clear(job.id, EXTRACT_STEP).await?;
            checkpoint = None;
        }

        let encoder = encoder_for(&self.interface, &self.mappings)?;
        let schema = self
            .interface
            .processing
            .record_schema
            .as_deref()
            .map(|path| self.schemas.get_or_load(path))
            .transpose()?;
        let processor = RecordProcessor::new(self.interface.processing.clone(), schema);

        let mut writer =
            CheckpointedWriter::open(&provisional, encoder, checkpoint.as_ref().map(|c| c.writer))?;
        let mut reader = CursorReader::new(Arc::clone(&self.source), &self.interface.source);
        reader.open(checkpoint.as_ref().map(|c| c.reader))?;
        let mut counts = checkpoint.map(|c| c.counts).unwrap_or_default();

        match self
            .run_chunks(job.id, &processor, &mut reader, &mut writer, &mut counts)
            .await
        {
            Ok(true) => {
                let records_written = writer.record_count();
                let size = writer.close(true)?;
                let metrics = job_metrics(reader.records_read(), &counts);
                info!(
                    job_id = %job.id,
                    records_read = metrics.processed,
                    records_written,
                    filtered = counts.filtered,
                    skipped = counts.skipped,
                    invalid = counts.invalid,
                    size,
                    "Extraction finished"
                );
                Ok(StepEnd::Exhausted {
                    records_written,
                    metrics,
                })
            },
            Ok(false) => {
                writer.close(false)?;
                Ok(StepEnd::Stopped {
                    records_read: reader.records_read(),
                })
            },
            Err(e) => {
                if let Err(close_err) = writer.close(false) {
                    warn!(job_id = %job.id, error = %close_err, "Could not close provisional file");
                }
                Err(e)
            },
        }
    }

    /// Process chunks until the reader is exhausted (`true`) or the job was
    /// stopped (`false`)
    async fn run_chunks(
        &self,
        job_id: Uuid,
        processor: &RecordProcessor,
        reader: &mut CursorReader,
        writer: &mut CheckpointedWriter,
        counts: &mut OutcomeCounts,
    ) -> Result<bool> {
        let chunk_size = self.interface.processing.chunk_size;
        let skip_limit = self.interface.processing.skip_limit;

        loop {
            if self.machine.load(job_id).await?.status == JobStatus::Stopped {
                return Ok(false);
            }

            let chunk = reader.read_chunk(chunk_size).await?;
            if chunk.is_empty() {
                return Ok(true);
            }

            let mut accepted = Vec::with_capacity(chunk.len());
            for record in chunk {
                match processor.process(record) {
                    Ok(Outcome::Accepted(record)) => accepted.push(record),
                    Ok(Outcome::Filtered) => counts.filtered += 1,
                    Ok(Outcome::Invalid(reason)) => {
                        counts.invalid += 1;
                        debug!(job_id = %job_id, reason = %reason, "Record failed schema validation");
                    },
                    Err(e) if e.is_record_level() => {
                        counts.skipped += 1;
                        warn!(job_id = %job_id, error = %e, "Skipping record");
                        if counts.skipped > skip_limit {
                            return Err(ExtractError::SkipLimitExceeded {
                                skipped: counts.skipped,
                                limit: skip_limit,
                            });
                        }
                    },
                    Err(e) => return Err(e),
                }
            }

            writer.write(&accepted)?;
            let checkpoint = StepCheckpoint {
                reader: reader.checkpoint()?,
                writer: writer.checkpoint()?,
                counts: *counts,
                updated_at: Utc::now(),
            };
            self.checkpoints
                .save(job_id, EXTRACT_STEP, &checkpoint)
                .await?;
            self.machine
                .store()
                .update_metrics(job_id, job_metrics(checkpoint.reader.records_read, counts))
                .await?;

            debug!(
                job_id = %job_id,
                records_read = checkpoint.reader.records_read,
                last_key = ?checkpoint.reader.last_key,
                offset = checkpoint.writer.offset,
                "Checkpoint saved"
            );
        }
    }

    async fn complete(
        &self,
        job: &JobRecord,
        records_written: u64,
        metrics: JobMetrics,
    ) -> Result<JobOutcome> {
        match self
            .machine
            .transition(job.id, JobStatus::Finalizing, None)
            .await
        {
            Ok(_) => {},
            Err(ExtractError::IllegalTransition {
                from: JobStatus::Stopped,
                ..
            }) => {
                // stopped after the last chunk; the footer lies past the
                // checkpoint and is cut off on resume
                return Ok(JobOutcome::Stopped {
                    records_read: metrics.processed,
                });
            },
            Err(e) => return Err(e),
        }

        self.finish(job, Some(records_written), metrics).await
    }

    /// Finish a job left in `FINALIZING` by an interrupted process. A file
    /// that already verifies is accepted; a complete provisional file is
    /// finalized again; anything else fails the job.
    ///
    /// The rename consumes the provisional file, so a final file found next
    /// to a provisional one was not put there by this job and is left alone.
    pub async fn recover_finalizing(&self, job: &JobRecord) -> Result<JobOutcome> {
        let finalizer = self.finalizer.clone();
        let final_path = job.output_path.clone();
        let provisional = provisional_path(&job.output_path);
        let (final_exists, provisional_exists, verified) = tokio::task::spawn_blocking(move || {
            let final_exists = final_path.exists();
            let provisional_exists = provisional.exists();
            let verified = final_exists && !provisional_exists && finalizer.verify(&final_path);
            (final_exists, provisional_exists, verified)
        })
        .await
        .map_err(|e| ExtractError::write(format!("verify task failed: {e}")))?;

        if verified {
            let digest = bif_common::checksum::SidecarLine::read_from(
                crate::finalizer::sidecar_path(&job.output_path),
            )?
            .hex_digest;
            self.machine
                .transition(job.id, JobStatus::Completed, None)
                .await?;
            self.checkpoints.clear(job.id, EXTRACT_STEP).await?;
            info!(job_id = %job.id, "Recovered finalized job");
            let metrics = job.metrics();
            return Ok(JobOutcome::Completed {
                final_path: job.output_path.clone(),
                digest,
                records_written: written_from(&metrics),
                metrics,
            });
        }

        if provisional_exists && !final_exists {
            info!(job_id = %job.id, "Re-running finalization of interrupted job");
            return self.finish(job, None, job.metrics()).await;
        }

        let (reason, renamed) = if provisional_exists {
            (
                format!("final file {} is occupied by another artifact", job.output_path.display()),
                false,
            )
        } else {
            (
                "interrupted during finalization; final file missing or unverifiable".to_string(),
                final_exists,
            )
        };
        self.abandon(job, reason, renamed).await
    }

    /// Rename, checksum, verify and optionally validate, then complete.
    /// `expected` is the number of records written, when known.
    async fn finish(
        &self,
        job: &JobRecord,
        expected: Option<u64>,
        metrics: JobMetrics,
    ) -> Result<JobOutcome> {
        let provisional = provisional_path(&job.output_path);
        let finalizer = self.finalizer.clone();
        let report = tokio::task::spawn_blocking(move || finalizer.finalize(&provisional))
            .await
            .map_err(|e| ExtractError::write(format!("finalize task failed: {e}")))?;

        let renamed = report.renamed();
        let report = match report.into_result() {
            Ok(report) => report,
            Err(e) => return self.abandon(job, e.to_string(), renamed).await,
        };
        let (Some(final_path), Some(digest)) = (report.final_path, report.digest) else {
            return self
                .abandon(job, "finalizer reported success without a path".to_string(), renamed)
                .await;
        };

        let finalizer = self.finalizer.clone();
        let verify_path = final_path.clone();
        let verified = tokio::task::spawn_blocking(move || finalizer.verify(&verify_path))
            .await
            .map_err(|e| ExtractError::write(format!("verify task failed: {e}")))?;
        if !verified {
            return self
                .abandon(
                    job,
                    format!("checksum verification failed for {}", final_path.display()),
                    true,
                )
                .await;
        }

        let records_written = if self.interface.validation.content {
            match self.validate_content(&final_path, expected).await {
                Ok(found) => found,
                Err(e) => return self.abandon(job, e.to_string(), true).await,
            }
        } else {
            expected.unwrap_or_else(|| written_from(&metrics))
        };

        self.machine
            .transition(job.id, JobStatus::Completed, None)
            .await?;
        self.checkpoints.clear(job.id, EXTRACT_STEP).await?;
        info!(
            job_id = %job.id,
            final_path = %final_path.display(),
            records_written,
            "Job completed"
        );

        Ok(JobOutcome::Completed {
            final_path,
            digest,
            records_written,
            metrics,
        })
    }

    async fn validate_content(&self, final_path: &Path, expected: Option<u64>) -> Result<u64> {
        let mapping = match &self.interface.output.encoding {
            EncodingConfig::Delimited { mapping_file, .. } => {
                Some(self.mappings.get_or_load(mapping_file)?)
            },
            _ => None,
        };
        let validator = ContentValidator::new(self.interface.output.encoding.clone(), mapping);
        let path = final_path.to_path_buf();
        let found = tokio::task::spawn_blocking(move || validator.validate(&path))
            .await
            .map_err(|e| ExtractError::write(format!("validation task failed: {e}")))??;
        match expected {
            Some(written) if written != found => Err(ExtractError::ContentInvalid(format!(
                "file holds {found} records, {written} were written"
            ))),
            _ => Ok(found),
        }
    }

    /// Fail a job whose finalization went wrong and remove its artifacts.
    /// The final file and sidecar are removed only when `renamed` says this
    /// job put them there.
    async fn abandon(&self, job: &JobRecord, reason: String, renamed: bool) -> Result<JobOutcome> {
        warn!(job_id = %job.id, reason = %reason, renamed, "Finalization failed, cleaning up");
        let finalizer = self.finalizer.clone();
        let final_path = job.output_path.clone();
        let cleanup = tokio::task::spawn_blocking(move || {
            if renamed {
                finalizer.cleanup(&final_path)
            } else {
                finalizer.discard_provisional(&final_path)
            }
        });
        match cleanup.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!(job_id = %job.id, error = %e, "Cleanup incomplete"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Cleanup task failed"),
        }
        self.machine
            .transition(job.id, JobStatus::Failed, Some(reason.clone()))
            .await?;
        self.checkpoints.clear(job.id, EXTRACT_STEP).await?;
        Ok(JobOutcome::Failed { reason })
    }

    async fn fail_or_stop(&self, job_id: Uuid, error: ExtractError) -> Result<JobOutcome> {
        let current = self.machine.load(job_id).await?;
        if current.status == JobStatus::Stopped {
            info!(job_id = %job_id, error = %error, "Job was stopped while failing; keeping checkpoint");
            return Ok(JobOutcome::Stopped {
                records_read: current.records_processed,
            });
        }

        let reason = error.to_string();
        warn!(job_id = %job_id, error = %reason, "Job failed");
        self.machine
            .transition(job_id, JobStatus::Failed, Some(reason.clone()))
            .await?;
        Ok(JobOutcome::Failed { reason })
    }
}

fn written_from(metrics: &JobMetrics) -> u64 {
    metrics
        .processed
        .saturating_sub(metrics.filtered + metrics.skipped + metrics.invalid)
}

fn job_metrics(records_read: u64, counts: &OutcomeCounts) -> JobMetrics {
    JobMetrics {
        processed: records_read,
        skipped: counts.skipped,
        invalid: counts.invalid,
        filtered: counts.filtered,
    }
}
