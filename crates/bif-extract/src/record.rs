//! Typed records read from the relational source
//!
//! A [`Record`] is an ordered set of uniquely named values. The column set is
//! only known once the first page has been fetched, so nothing here is tied
//! to a static schema. Nested shapes carry their child rows in
//! [`Record::children`].

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::types::BigDecimal;
use std::fmt;
use std::str::FromStr;

use crate::error::{ExtractError, Result};

/// A single typed column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(BigDecimal),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

/// The kind of a [`Value`], used by record schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Null,
    String,
    Integer,
    Decimal,
    Boolean,
    Timestamp,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Text(_) => ValueKind::String,
            Value::Integer(_) => ValueKind::Integer,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Timestamp(_) => ValueKind::Timestamp,
        }
    }

    /// Null, or text that is empty after trimming
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view for business rules; text is parsed leniently
    pub fn as_decimal(&self) -> Option<BigDecimal> {
        match self {
            Value::Integer(v) => Some(BigDecimal::from(*v)),
            Value::Decimal(d) => Some(d.clone()),
            Value::Text(s) => BigDecimal::from_str(s.trim()).ok(),
            _ => None,
        }
    }

    pub fn decimal(text: &str) -> Result<Self> {
        BigDecimal::from_str(text)
            .map(Value::Decimal)
            .map_err(|e| ExtractError::data_shape(format!("invalid decimal {text:?}: {e}")))
    }
}

impl fmt::Display for Value {
    /// Text rendering used by the markup and delimited encodings
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Text(s) => f.write_str(s),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Timestamp(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<BigDecimal> for Value {
    fn from(v: BigDecimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<Field>,
    children: Vec<Record>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from name/value pairs, rejecting repeated names
    pub fn from_pairs<I, N, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<Value>,
    {
        let mut record = Record::new();
        for (name, value) in pairs {
            record.push(name, value)?;
        }
        Ok(record)
    }

    /// Append a field; a name may appear only once per record
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let name = name.into();
        if self.fields.iter().any(|f| f.name == name) {
            return Err(ExtractError::data_shape(format!(
                "column {name} appears more than once in a record"
            )));
        }
        self.fields.push(Field {
            name,
            value: value.into(),
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Replace the value of `name`, appending the field if absent
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.value = value.into(),
            None => self.fields.push(Field {
                name: name.to_string(),
                value: value.into(),
            }),
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn children(&self) -> &[Record] {
        &self.children
    }

    pub fn push_child(&mut self, child: Record) {
        self.children.push(child);
    }

    /// No fields and no children
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.children.is_empty()
    }

    /// Every field is null or blank text
    pub fn is_blank(&self) -> bool {
        self.children.is_empty() && self.fields.iter().all(|f| f.value.is_blank())
    }

    /// Trim every text value, children included
    pub fn trim_text(&mut self) {
        for field in &mut self.fields {
            if let Value::Text(s) = &mut field.value {
                let trimmed = s.trim();
                if trimmed.len() != s.len() {
                    *s = trimmed.to_string();
                }
            }
        }
        for child in &mut self.children {
            child.trim_text();
        }
    }

    /// The ordering key of this record. A missing, null or non-integer key
    /// breaks keyset pagination and is reported as a data shape violation.
    pub fn key(&self, column: &str) -> Result<i64> {
        match self.get(column) {
            Some(Value::Integer(v)) => Ok(*v),
            Some(Value::Null) => Err(ExtractError::data_shape(format!(
                "ordering key {column} is null"
            ))),
            Some(other) => Err(ExtractError::data_shape(format!(
                "ordering key {column} is not an integer ({:?})",
                other.kind()
            ))),
            None => Err(ExtractError::data_shape(format!(
                "ordering key {column} is missing from the row"
            ))),
        }
    }

    /// Split a flat joined row into parent-only and child-only records
    pub(crate) fn split_columns(self, child_columns: &[String]) -> (Record, Record) {
        let mut parent = Record::new();
        let mut child = Record::new();
        for field in self.fields {
            if child_columns.iter().any(|c| *c == field.name) {
                child.fields.push(field);
            } else {
                parent.fields.push(field);
            }
        }
        (parent, child)
    }
}
