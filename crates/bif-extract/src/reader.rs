//! Restartable keyset cursor over a [`RecordSource`]
//!
//! The reader pages through the source with `key > last_seen` predicates and
//! never uses offsets, so a restart from a checkpoint sees neither gaps nor
//! duplicates as long as keys are unique and strictly increasing. Any page
//! violating that ordering is rejected as a data shape error.
//!
//! For nested shapes every page is fetched in two phases: the parent rows
//! first, then all child rows for the page's keys in one bulk call. Child rows
//! arrive in arbitrary order and are regrouped under their parents, which keep
//! the phase-one key order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::checkpoint::{Checkpointable, ReaderCheckpoint};
use crate::error::{ExtractError, Result};
use crate::interface::{SourceConfig, SourceShape};
use crate::record::Record;
use crate::retry::RetryPolicy;
use crate::source::RecordSource;

pub struct CursorReader {
    source: Arc<dyn RecordSource>,
    key_column: String,
    child_columns: Option<Vec<String>>,
    page_size: usize,
    retry: RetryPolicy,
    buffer: VecDeque<Record>,
    /// Key of the last row pulled from the source; the next page starts after it
    fetch_cursor: Option<i64>,
    /// Key of the last record handed to the caller
    last_key: Option<i64>,
    records_read: u64,
    exhausted: bool,
}

impl CursorReader {
    pub fn new(source: Arc<dyn RecordSource>, config: &SourceConfig) -> Self {
        let child_columns = match &config.shape {
            SourceShape::Flat => None,
            SourceShape::Nested { child_columns, .. } => Some(child_columns.clone()),
        };
        Self {
            source,
            key_column: config.key_column.clone(),
            child_columns,
            page_size: config.page_size.max(1),
            retry: RetryPolicy::from(&config.retry),
            buffer: VecDeque::new(),
            fetch_cursor: None,
            last_key: None,
            records_read: 0,
            exhausted: false,
        }
    }

    /// Position the cursor at the start or at a saved checkpoint
    pub fn open(&mut self, checkpoint: Option<ReaderCheckpoint>) -> Result<()> {
        let state = checkpoint.unwrap_or_default();
        if state.records_read > 0 || state.last_key.is_some() {
            info!(
                records_read = state.records_read,
                last_key = ?state.last_key,
                "Resuming reader from checkpoint"
            );
        }
        self.restore(state)
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    pub fn last_key(&self) -> Option<i64> {
        self.last_key
    }

    /// Next record, or `None` once the source returns an empty page
    pub async fn next(&mut self) -> Result<Option<Record>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }

        let Some(record) = self.buffer.pop_front() else {
            return Ok(None);
        };
        self.last_key = Some(record.key(&self.key_column)?);
        self.records_read += 1;
        Ok(Some(record))
    }

    /// Up to `max` records; fewer only at end of stream
    pub async fn read_chunk(&mut self, max: usize) -> Result<Vec<Record>> {
        let mut chunk = Vec::with_capacity(max);
        while chunk.len() < max {
            match self.next().await? {
                Some(record) => chunk.push(record),
                None => break,
            }
        }
        Ok(chunk)
    }

    async fn fill(&mut self) -> Result<()> {
        let source = Arc::clone(&self.source);
        let after = self.fetch_cursor;
        let limit = self.page_size;
        let page = self
            .retry
            .run("fetch_page", || {
                let source = Arc::clone(&source);
                async move { source.fetch_page(after, limit).await }
            })
            .await?;

        if page.is_empty() {
            debug!(after = ?after, "Source exhausted");
            self.exhausted = true;
            return Ok(());
        }

        let keys = self.check_order(&page)?;
        let page = match &self.child_columns {
            None => page,
            Some(child_columns) => {
                let details = self.fetch_details(&keys).await?;
                attach_children(&self.key_column, child_columns, page, &keys, details)?
            },
        };

        debug!(
            after = ?after,
            rows = page.len(),
            first_key = ?keys.first(),
            last_key = ?keys.last(),
            "Buffered source page"
        );
        self.fetch_cursor = keys.last().copied();
        self.buffer.extend(page);
        Ok(())
    }

    async fn fetch_details(&self, keys: &[i64]) -> Result<Vec<Record>> {
        let source = Arc::clone(&self.source);
        let keys = keys.to_vec();
        self.retry
            .run("fetch_details", || {
                let source = Arc::clone(&source);
                let keys = keys.clone();
                async move { source.fetch_details(&keys).await }
            })
            .await
    }

    /// Keys of `page`, which must continue strictly after the cursor
    fn check_order(&self, page: &[Record]) -> Result<Vec<i64>> {
        let mut previous = self.fetch_cursor;
        let mut keys = Vec::with_capacity(page.len());
        for record in page {
            let key = record.key(&self.key_column)?;
            if let Some(prev) = previous {
                if key <= prev {
                    return Err(ExtractError::data_shape(format!(
                        "ordering key {} went from {prev} to {key}; keys must be unique and increasing",
                        self.key_column
                    )));
                }
            }
            previous = Some(key);
            keys.push(key);
        }
        Ok(keys)
    }
}

fn attach_children(
    key_column: &str,
    child_columns: &[String],
    mut parents: Vec<Record>,
    keys: &[i64],
    details: Vec<Record>,
) -> Result<Vec<Record>> {
    let positions: HashMap<i64, usize> = keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();

    for row in details {
        let key = row.key(key_column)?;
        let Some(&position) = positions.get(&key) else {
            return Err(ExtractError::data_shape(format!(
                "detail row references {key_column}={key} outside the current page"
            )));
        };
        let (_, child) = row.split_columns(child_columns);
        parents[position].push_child(child);
    }
    Ok(parents)
}

impl Checkpointable for CursorReader {
    type State = ReaderCheckpoint;

    fn checkpoint(&mut self) -> Result<ReaderCheckpoint> {
        Ok(ReaderCheckpoint {
            records_read: self.records_read,
            last_key: self.last_key,
        })
    }

    fn restore(&mut self, state: ReaderCheckpoint) -> Result<()> {
        self.buffer.clear();
        self.fetch_cursor = state.last_key;
        self.last_key = state.last_key;
        self.records_read = state.records_read;
        self.exhausted = false;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::interface::RetryConfig;
    use crate::record::Value;
    use crate::source::memory::InjectedFailure;
    use crate::source::InMemorySource;

    fn flat_config(page_size: usize) -> SourceConfig {
        SourceConfig {
            table: "accounts".to_string(),
            key_column: "id".to_string(),
            columns: Vec::new(),
            shape: SourceShape::Flat,
            page_size,
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
        }
    }

    fn row(id: i64) -> Record {
        Record::from_pairs([("id", Value::from(id)), ("name", Value::from(format!("n{id}")))])
            .unwrap()
    }

    fn keys(records: &[Record]) -> Vec<i64> {
        records.iter().map(|r| r.key("id").unwrap()).collect()
    }

    #[tokio::test]
    async fn test_reads_all_rows_across_pages() {
        let source = Arc::new(InMemorySource::new("id", (1..=25).map(row).collect()));
        let mut reader = CursorReader::new(source.clone(), &flat_config(10));
        reader.open(None).unwrap();

        let mut all = Vec::new();
        loop {
            let chunk = reader.read_chunk(7).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            all.extend(chunk);
        }

        assert_eq!(keys(&all), (1..=25).collect::<Vec<_>>());
        assert_eq!(reader.records_read(), 25);
        // three full or partial pages plus the empty terminating page
        assert_eq!(source.page_calls(), 4);
    }

    #[tokio::test]
    async fn test_restart_resumes_after_checkpoint() {
        let source = Arc::new(InMemorySource::new("id", (1..=30).map(row).collect()));
        let mut reader = CursorReader::new(source.clone(), &flat_config(8));
        reader.open(None).unwrap();
        reader.read_chunk(12).await.unwrap();
        let saved = reader.checkpoint().unwrap();
        assert_eq!(saved.last_key, Some(12));

        let mut resumed = CursorReader::new(source, &flat_config(8));
        resumed.open(Some(saved)).unwrap();
        let rest = resumed.read_chunk(100).await.unwrap();
        assert_eq!(keys(&rest), (13..=30).collect::<Vec<_>>());
        assert_eq!(resumed.records_read(), 30);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_data_shape_error() {
        let source = Arc::new(InMemorySource::scripted(
            "id",
            vec![vec![row(1), row(2), row(2)]],
        ));
        let mut reader = CursorReader::new(source, &flat_config(10));
        reader.open(None).unwrap();
        let err = reader.next().await.unwrap_err();
        assert!(matches!(err, ExtractError::DataShape(_)));
    }

    #[tokio::test]
    async fn test_page_not_after_cursor_is_rejected() {
        let source = Arc::new(InMemorySource::scripted(
            "id",
            vec![vec![row(5), row(6)], vec![row(6), row(7)]],
        ));
        let mut reader = CursorReader::new(source, &flat_config(2));
        reader.open(None).unwrap();
        reader.read_chunk(2).await.unwrap();
        assert!(matches!(reader.next().await, Err(ExtractError::DataShape(_))));
    }

    #[tokio::test]
    async fn test_null_key_is_data_shape_error() {
        let bad = Record::from_pairs([("id", Value::Null)]).unwrap();
        let source = Arc::new(InMemorySource::scripted("id", vec![vec![bad]]));
        let mut reader = CursorReader::new(source, &flat_config(10));
        reader.open(None).unwrap();
        assert!(matches!(reader.next().await, Err(ExtractError::DataShape(_))));
    }

    #[tokio::test]
    async fn test_short_page_is_not_end_of_stream() {
        let source = Arc::new(InMemorySource::scripted(
            "id",
            vec![vec![row(1)], vec![row(2), row(3)]],
        ));
        let mut reader = CursorReader::new(source, &flat_config(5));
        reader.open(None).unwrap();
        let all = reader.read_chunk(10).await.unwrap();
        assert_eq!(keys(&all), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let source = Arc::new(InMemorySource::new("id", (1..=3).map(row).collect()));
        source
            .inject([
                InjectedFailure::Transient("connection reset".into()),
                InjectedFailure::Transient("deadlock detected".into()),
            ])
            .await;
        let mut reader = CursorReader::new(source.clone(), &flat_config(10));
        reader.open(None).unwrap();
        assert_eq!(reader.read_chunk(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let source = Arc::new(InMemorySource::new("id", (1..=3).map(row).collect()));
        source
            .inject([InjectedFailure::Fatal("relation does not exist".into())])
            .await;
        let mut reader = CursorReader::new(source.clone(), &flat_config(10));
        reader.open(None).unwrap();
        assert!(matches!(reader.next().await, Err(ExtractError::Source(_))));
        assert_eq!(source.page_calls(), 1);
    }

    #[tokio::test]
    async fn test_nested_children_regrouped_in_key_order() {
        let parents = (1..=3)
            .map(|id| Record::from_pairs([("order_id", Value::from(id))]).unwrap())
            .collect();
        let line = |order: i64, sku: &str| {
            Record::from_pairs([("order_id", Value::from(order)), ("sku", Value::from(sku))])
                .unwrap()
        };
        let details = vec![line(3, "C1"), line(1, "A1"), line(3, "C2"), line(1, "A2")];
        let source = Arc::new(InMemorySource::new("order_id", parents).with_details(details));

        let mut config = flat_config(10);
        config.key_column = "order_id".to_string();
        config.shape = SourceShape::Nested {
            detail_table: "order_lines".to_string(),
            child_columns: vec!["sku".to_string()],
            children_name: "Lines".to_string(),
            child_order: Vec::new(),
        };
        let mut reader = CursorReader::new(source.clone(), &config);
        reader.open(None).unwrap();
        let orders = reader.read_chunk(10).await.unwrap();

        assert_eq!(orders.len(), 3);
        let skus = |r: &Record| -> Vec<String> {
            r.children()
                .iter()
                .map(|c| c.get("sku").unwrap().to_string())
                .collect()
        };
        assert_eq!(skus(&orders[0]), vec!["A1", "A2"]);
        assert!(orders[1].children().is_empty());
        assert_eq!(skus(&orders[2]), vec!["C1", "C2"]);
        assert!(orders[0].children()[0].get("order_id").is_none());
        assert_eq!(source.detail_calls(), 1);
    }
}
