//! `bif_jobs` backed job store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use std::path::PathBuf;
use uuid::Uuid;

use super::{from_db_count, to_db_count};
use crate::error::{ExtractError, Result};
use crate::job::{JobMetrics, JobRecord, JobStatus, JobStore, NewJob, StatusUpdate};

/// Name of the partial unique index guarding single processing per interface
const ONE_PROCESSING_INDEX: &str = "uq_bif_jobs_one_processing";

const JOB_COLUMNS: &str = "id, interface_type, file_name, output_path, owner, status, \
    records_processed, records_skipped, records_invalid, records_filtered, \
    error_message, created_at, started_at, completed_at, version";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    interface_type: String,
    file_name: String,
    output_path: String,
    owner: String,
    status: String,
    records_processed: i64,
    records_skipped: i64,
    records_invalid: i64,
    records_filtered: i64,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = ExtractError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(JobRecord {
            id: row.id,
            interface_type: row.interface_type,
            file_name: row.file_name,
            output_path: PathBuf::from(row.output_path),
            owner: row.owner,
            status: row.status.parse()?,
            records_processed: from_db_count(row.records_processed),
            records_skipped: from_db_count(row.records_skipped),
            records_invalid: from_db_count(row.records_invalid),
            records_filtered: from_db_count(row.records_filtered),
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            version: row.version,
        })
    }
}

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select(&self, filter: &str, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM bif_jobs WHERE {filter} ORDER BY created_at");
        let mut query = sqlx::query_as::<_, JobRow>(&sql);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(JobRecord::try_from)
            .collect()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: NewJob) -> Result<JobRecord> {
        let record = JobRecord::new(job, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO bif_jobs (id, interface_type, file_name, output_path, owner, status, created_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(&record.interface_type)
        .bind(&record.file_name)
        .bind(record.output_path.to_string_lossy().as_ref())
        .bind(&record.owner)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.version)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM bif_jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRecord::try_from)
            .transpose()
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE bif_jobs
            SET status = $3,
                error_message = $4,
                completed_at = COALESCE($5, completed_at),
                started_at = CASE WHEN $3 = 'PROCESSING' THEN COALESCE(started_at, NOW())
                                  ELSE started_at END,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(update.job_id)
        .bind(update.expected_version)
        .bind(update.status.as_str())
        .bind(update.error_message.as_deref())
        .bind(update.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                if done.rows_affected() == 0 && self.get(update.job_id).await?.is_none() {
                    return Err(ExtractError::JobNotFound(update.job_id));
                }
                Ok(done.rows_affected())
            },
            Err(sqlx::Error::Database(db))
                if db.is_unique_violation() && db.constraint() == Some(ONE_PROCESSING_INDEX) =>
            {
                let interface_type: String =
                    sqlx::query_scalar("SELECT interface_type FROM bif_jobs WHERE id = $1")
                        .bind(update.job_id)
                        .fetch_one(&self.pool)
                        .await?;
                Err(ExtractError::AlreadyRunning(interface_type))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn update_metrics(&self, job_id: Uuid, metrics: JobMetrics) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE bif_jobs
            SET records_processed = $2, records_skipped = $3,
                records_invalid = $4, records_filtered = $5
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(to_db_count(metrics.processed))
        .bind(to_db_count(metrics.skipped))
        .bind(to_db_count(metrics.invalid))
        .bind(to_db_count(metrics.filtered))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ExtractError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn find_pending(&self) -> Result<Vec<JobRecord>> {
        self.select("status IN ('PENDING', 'QUEUED')", None).await
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        self.select("status = $1", Some(status)).await
    }

    async fn exists_running(&self, interface_type: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM bif_jobs WHERE interface_type = $1 AND status = 'PROCESSING')",
        )
        .bind(interface_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}
