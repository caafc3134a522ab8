//! In-memory record source used by tests and dry runs

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::RecordSource;
use crate::error::{ExtractError, Result};
use crate::record::Record;

/// Failure to inject into the next source call
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    Transient(String),
    Fatal(String),
}

impl From<InjectedFailure> for ExtractError {
    fn from(failure: InjectedFailure) -> Self {
        match failure {
            InjectedFailure::Transient(msg) => ExtractError::Transient(msg),
            InjectedFailure::Fatal(msg) => ExtractError::Source(msg),
        }
    }
}

enum Rows {
    /// Keyed rows served by keyset pagination
    Keyed { key_column: String, rows: Vec<Record> },
    /// Pages returned verbatim, in order, whatever the arguments
    Scripted(VecDeque<Vec<Record>>),
}

pub struct InMemorySource {
    rows: Mutex<Rows>,
    details: Vec<Record>,
    key_column: String,
    failures: Mutex<VecDeque<InjectedFailure>>,
    page_calls: AtomicU64,
    detail_calls: AtomicU64,
}

impl InMemorySource {
    /// Rows are sorted by `key_column`; rows without an integer key sort first
    pub fn new(key_column: impl Into<String>, mut rows: Vec<Record>) -> Self {
        let key_column = key_column.into();
        rows.sort_by_key(|r| r.key(&key_column).ok());
        Self {
            rows: Mutex::new(Rows::Keyed {
                key_column: key_column.clone(),
                rows,
            }),
            details: Vec::new(),
            key_column,
            failures: Mutex::new(VecDeque::new()),
            page_calls: AtomicU64::new(0),
            detail_calls: AtomicU64::new(0),
        }
    }

    /// Serve `pages` one after another, then empty pages
    pub fn scripted(key_column: impl Into<String>, pages: Vec<Vec<Record>>) -> Self {
        Self {
            rows: Mutex::new(Rows::Scripted(pages.into())),
            details: Vec::new(),
            key_column: key_column.into(),
            failures: Mutex::new(VecDeque::new()),
            page_calls: AtomicU64::new(0),
            detail_calls: AtomicU64::new(0),
        }
    }

    /// Child rows for nested shapes, stored in the given (arbitrary) order
    pub fn with_details(mut self, details: Vec<Record>) -> Self {
        self.details = details;
        self
    }

    /// Fail the next source calls, one failure per call
    pub async fn inject(&self, failures: impl IntoIterator<Item = InjectedFailure>) {
        self.failures.lock().await.extend(failures);
    }

    pub fn page_calls(&self) -> u64 {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> u64 {
        self.detail_calls.load(Ordering::SeqCst)
    }

    async fn next_failure(&self) -> Result<()> {
        match self.failures.lock().await.pop_front() {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecordSource for InMemorySource {
    async fn fetch_page(&self, after: Option<i64>, limit: usize) -> Result<Vec<Record>> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.next_failure().await?;

        let mut rows = self.rows.lock().await;
        match &mut *rows {
            Rows::Keyed { key_column, rows } => Ok(rows
                .iter()
                .filter(|r| match (r.key(key_column).ok(), after) {
                    (Some(key), Some(after)) => key > after,
                    (_, None) => true,
                    (None, Some(_)) => false,
                })
                .take(limit)
                .cloned()
                .collect()),
            Rows::Scripted(pages) => Ok(pages.pop_front().unwrap_or_default()),
        }
    }

    async fn fetch_details(&self, keys: &[i64]) -> Result<Vec<Record>> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.next_failure().await?;

        Ok(self
            .details
            .iter()
            .filter(|d| {
                d.key(&self.key_column)
                    .map(|k| keys.contains(&k))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}
