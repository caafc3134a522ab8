//! Relational record sources
//!
//! A source serves rows in strictly increasing key order. Nested shapes use a
//! second call that fetches the child rows of a whole page in bulk.

use async_trait::async_trait;

use crate::error::Result;
use crate::record::Record;

pub mod memory;
pub mod postgres;

pub use memory::InMemorySource;
pub use postgres::PgRecordSource;

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Up to `limit` rows with key strictly greater than `after`, ordered by
    /// key ascending. An empty page means the source is exhausted.
    async fn fetch_page(&self, after: Option<i64>, limit: usize) -> Result<Vec<Record>>;

    /// Child rows for the given parent keys in no particular order. Each row
    /// carries the parent key column plus the configured child columns.
    async fn fetch_details(&self, keys: &[i64]) -> Result<Vec<Record>>;
}
