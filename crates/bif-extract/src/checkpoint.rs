//! Restart state for the extraction step
//!
//! A checkpoint pairs the reader cursor with the writer's byte offset. Both
//! halves are taken at the same chunk boundary, so on restart the reader
//! resumes exactly after the last record that is physically in the file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;

/// Step name under which the extraction checkpoint is stored
pub const EXTRACT_STEP: &str = "extract";

/// Explicit save/restore capability of a pipeline component
pub trait Checkpointable {
    type State;

    /// Capture the current restart state. May flush buffered output.
    fn checkpoint(&mut self) -> Result<Self::State>;

    /// Reposition to a previously captured state
    fn restore(&mut self, state: Self::State) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderCheckpoint {
    /// Records handed to the caller so far
    pub records_read: u64,
    /// Ordering key of the last record handed out
    pub last_key: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterCheckpoint {
    /// Durable size of the provisional file
    pub offset: u64,
    /// Records encoded into the file so far
    pub record_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub filtered: u64,
    pub skipped: u64,
    pub invalid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub reader: ReaderCheckpoint,
    pub writer: WriterCheckpoint,
    pub counts: OutcomeCounts,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, job_id: Uuid, step: &str) -> Result<Option<StepCheckpoint>>;

    /// Replace the stored checkpoint; must be durable when it returns
    async fn save(&self, job_id: Uuid, step: &str, checkpoint: &StepCheckpoint) -> Result<()>;

    async fn clear(&self, job_id: Uuid, step: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: RwLock<HashMap<(Uuid, String), StepCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, job_id: Uuid, step: &str) -> Result<Option<StepCheckpoint>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(job_id, step.to_string()))
            .cloned())
    }

    async fn save(&self, job_id: Uuid, step: &str, checkpoint: &StepCheckpoint) -> Result<()> {
        self.entries
            .write()
            .await
            .insert((job_id, step.to_string()), checkpoint.clone());
        Ok(())
    }

    async fn clear(&self, job_id: Uuid, step: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .remove(&(job_id, step.to_string()));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_clear() {
        let store = InMemoryCheckpointStore::new();
        let job_id = Uuid::new_v4();
        assert!(store.load(job_id, EXTRACT_STEP).await.unwrap().is_none());

        let checkpoint = StepCheckpoint {
            reader: ReaderCheckpoint {
                records_read: 1800,
                last_key: Some(1800),
            },
            writer: WriterCheckpoint {
                offset: 123_456,
                record_count: 1790,
            },
            counts: OutcomeCounts {
                filtered: 10,
                ..Default::default()
            },
            updated_at: Utc::now(),
        };
        store.save(job_id, EXTRACT_STEP, &checkpoint).await.unwrap();
        assert_eq!(
            store.load(job_id, EXTRACT_STEP).await.unwrap(),
            Some(checkpoint)
        );
        assert!(store.load(job_id, "other").await.unwrap().is_none());

        store.clear(job_id, EXTRACT_STEP).await.unwrap();
        assert!(store.load(job_id, EXTRACT_STEP).await.unwrap().is_none());
    }
}
