//! PostgreSQL record source
//!
//! Table and column names come from validated interface configuration and are
//! interpolated into the query text; all values are bound parameters.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::BigDecimal;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::debug;

use super::RecordSource;
use crate::error::{ExtractError, Result};
use crate::interface::{SourceConfig, SourceShape};
use crate::record::{Record, Value};

pub struct PgRecordSource {
    pool: PgPool,
    page_sql: String,
    detail_sql: Option<String>,
}

impl PgRecordSource {
    pub fn new(pool: PgPool, config: &SourceConfig) -> Self {
        let projection = if config.columns.is_empty() {
            "*".to_string()
        } else {
            config.columns.join(", ")
        };
        let key = &config.key_column;

        let page_sql = format!(
            "SELECT {projection} FROM {table} \
             WHERE ($1::BIGINT IS NULL OR {key} > $1) \
             ORDER BY {key} ASC LIMIT $2",
            table = config.table,
        );

        let detail_sql = match &config.shape {
            SourceShape::Flat => None,
            SourceShape::Nested {
                detail_table,
                child_columns,
                child_order,
                ..
            } => {
                let order = if child_order.is_empty() {
                    child_columns
                } else {
                    child_order
                };
                Some(format!(
                    "SELECT {key}::BIGINT AS {key}, {children} FROM {detail_table} \
                     WHERE {key} = ANY($1) ORDER BY {key}, {order}",
                    children = child_columns.join(", "),
                    order = order.join(", "),
                ))
            },
        };

        Self {
            pool,
            page_sql,
            detail_sql,
        }
    }
}

#[async_trait]
impl RecordSource for PgRecordSource {
    async fn fetch_page(&self, after: Option<i64>, limit: usize) -> Result<Vec<Record>> {
        let rows = sqlx::query(&self.page_sql)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

        debug!(after = ?after, rows = rows.len(), "Fetched source page");
        rows.iter().map(decode_row).collect()
    }

    async fn fetch_details(&self, keys: &[i64]) -> Result<Vec<Record>> {
        let Some(sql) = &self.detail_sql else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(sql)
            .bind(keys)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

        debug!(keys = keys.len(), rows = rows.len(), "Fetched detail rows");
        rows.iter().map(decode_row).collect()
    }
}

/// Sort database errors into retryable and fatal source errors
pub fn classify(err: sqlx::Error) -> ExtractError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => {
            ExtractError::Transient(err.to_string())
        },
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if is_transient_sqlstate(&code) => ExtractError::Transient(err.to_string()),
            _ => ExtractError::Source(err.to_string()),
        },
        _ => ExtractError::Source(err.to_string()),
    }
}

/// Connection exceptions (class 08), serialization failure, deadlock,
/// lock not available, query cancelled and too many connections
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "55P03" | "57014" | "53300")
}

fn decode_row(row: &PgRow) -> Result<Record> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_value(row, idx, column.type_info().name()).map_err(|e| {
            ExtractError::data_shape(format!("cannot decode column {}: {e}", column.name()))
        })?;
        record.push(column.name(), value)?;
    }
    Ok(record)
}

fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> std::result::Result<Value, sqlx::Error> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOL" => Value::Boolean(row.try_get(idx)?),
        "INT2" => Value::Integer(i64::from(row.try_get::<i16, _>(idx)?)),
        "INT4" => Value::Integer(i64::from(row.try_get::<i32, _>(idx)?)),
        "INT8" => Value::Integer(row.try_get(idx)?),
        "NUMERIC" => Value::Decimal(row.try_get::<BigDecimal, _>(idx)?),
        "FLOAT4" => Value::Text(row.try_get::<f32, _>(idx)?.to_string()),
        "FLOAT8" => Value::Text(row.try_get::<f64, _>(idx)?.to_string()),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => Value::Text(row.try_get(idx)?),
        "UUID" => Value::Text(row.try_get::<uuid::Uuid, _>(idx)?.to_string()),
        "TIMESTAMPTZ" => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(idx)?),
        "TIMESTAMP" => Value::Timestamp(row.try_get::<NaiveDateTime, _>(idx)?.and_utc()),
        "DATE" => Value::Text(row.try_get::<NaiveDate, _>(idx)?.format("%Y-%m-%d").to_string()),
        "JSON" | "JSONB" => Value::Text(row.try_get::<serde_json::Value, _>(idx)?.to_string()),
        other => {
            return Err(sqlx::Error::Decode(
                format!("unsupported column type {other}").into(),
            ))
        },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::RetryConfig;

    fn config(shape: SourceShape) -> SourceConfig {
        SourceConfig {
            table: "export.orders".to_string(),
            key_column: "order_id".to_string(),
            columns: vec!["order_id".to_string(), "customer".to_string()],
            shape,
            page_size: 1000,
            retry: RetryConfig::default(),
        }
    }

    #[test]
    fn test_transient_sqlstates() {
        for code in ["08006", "08001", "40001", "40P01", "55P03", "57014", "53300"] {
            assert!(is_transient_sqlstate(code), "{code}");
        }
        for code in ["42601", "23505", "42P01", "22P02"] {
            assert!(!is_transient_sqlstate(code), "{code}");
        }
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!classify(sqlx::Error::RowNotFound).is_transient());
    }

    #[tokio::test]
    async fn test_query_text() {
        let pool = PgPool::connect_lazy("postgresql://localhost/unused").unwrap_or_else(|e| panic!("{e}"));
        let flat = PgRecordSource::new(pool.clone(), &config(SourceShape::Flat));
        assert_eq!(
            flat.page_sql,
            "SELECT order_id, customer FROM export.orders \
             WHERE ($1::BIGINT IS NULL OR order_id > $1) ORDER BY order_id ASC LIMIT $2"
        );
        assert!(flat.detail_sql.is_none());

        let nested = PgRecordSource::new(
            pool.clone(),
            &config(SourceShape::Nested {
                detail_table: "export.order_lines".to_string(),
                child_columns: vec!["sku".to_string(), "quantity".to_string()],
                children_name: "Lines".to_string(),
                child_order: Vec::new(),
            }),
        );
        assert_eq!(
            nested.detail_sql.as_deref(),
            Some(
                "SELECT order_id::BIGINT AS order_id, sku, quantity FROM export.order_lines \
                 WHERE order_id = ANY($1) ORDER BY order_id, sku, quantity"
            )
        );

        let by_line = PgRecordSource::new(
            pool,
            &config(SourceShape::Nested {
                detail_table: "export.order_lines".to_string(),
                child_columns: vec!["sku".to_string(), "quantity".to_string()],
                children_name: "Lines".to_string(),
                child_order: vec!["line_no".to_string()],
            }),
        );
        assert!(by_line
            .detail_sql
            .as_deref()
            .unwrap_or_default()
            .ends_with("WHERE order_id = ANY($1) ORDER BY order_id, line_no"));
    }
}
