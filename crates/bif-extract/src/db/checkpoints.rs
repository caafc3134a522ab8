//! `bif_step_checkpoints` backed checkpoint store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{from_db_count, to_db_count};
use crate::checkpoint::{
    CheckpointStore, OutcomeCounts, ReaderCheckpoint, StepCheckpoint, WriterCheckpoint,
};
use crate::error::Result;

#[derive(Debug, sqlx::FromRow)]
struct CheckpointRow {
    byte_offset: i64,
    record_count: i64,
    last_key: Option<i64>,
    records_read: i64,
    filtered: i64,
    skipped: i64,
    invalid: i64,
    updated_at: DateTime<Utc>,
}

impl From<CheckpointRow> for StepCheckpoint {
    fn from(row: CheckpointRow) -> Self {
        StepCheckpoint {
            reader: ReaderCheckpoint {
                records_read: from_db_count(row.records_read),
                last_key: row.last_key,
            },
            writer: WriterCheckpoint {
                offset: from_db_count(row.byte_offset),
                record_count: from_db_count(row.record_count),
            },
            counts: OutcomeCounts {
                filtered: from_db_count(row.filtered),
                skipped: from_db_count(row.skipped),
                invalid: from_db_count(row.invalid),
            },
            updated_at: row.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, job_id: Uuid, step: &str) -> Result<Option<StepCheckpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT byte_offset, record_count, last_key, records_read,
                   filtered, skipped, invalid, updated_at
            FROM bif_step_checkpoints
            WHERE job_id = $1 AND step_name = $2
            "#,
        )
        .bind(job_id)
        .bind(step)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(StepCheckpoint::from))
    }

    async fn save(&self, job_id: Uuid, step: &str, checkpoint: &StepCheckpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bif_step_checkpoints
                (job_id, step_name, byte_offset, record_count, last_key, records_read,
                 filtered, skipped, invalid, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (job_id, step_name) DO UPDATE SET
                byte_offset = EXCLUDED.byte_offset,
                record_count = EXCLUDED.record_count,
                last_key = EXCLUDED.last_key,
                records_read = EXCLUDED.records_read,
                filtered = EXCLUDED.filtered,
                skipped = EXCLUDED.skipped,
                invalid = EXCLUDED.invalid,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job_id)
        .bind(step)
        .bind(to_db_count(checkpoint.writer.offset))
        .bind(to_db_count(checkpoint.writer.record_count))
        .bind(checkpoint.reader.last_key)
        .bind(to_db_count(checkpoint.reader.records_read))
        .bind(to_db_count(checkpoint.counts.filtered))
        .bind(to_db_count(checkpoint.counts.skipped))
        .bind(to_db_count(checkpoint.counts.invalid))
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, job_id: Uuid, step: &str) -> Result<()> {
        sqlx::query("DELETE FROM bif_step_checkpoints WHERE job_id = $1 AND step_name = $2")
            .bind(job_id)
            .bind(step)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
