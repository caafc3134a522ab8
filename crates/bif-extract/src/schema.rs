//! Record schemas and the parsed-schema cache
//!
//! Schemas and field mappings are small JSON documents referenced by path
//! from interface configurations. They are parsed once and shared through a
//! [`SchemaCache`], which the launcher owns and can invalidate when files
//! change on disk.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::error::{ExtractError, Result};
use crate::record::{Record, ValueKind};

/// Cache of parsed JSON documents keyed by canonical file path
pub struct SchemaCache<T> {
    entries: RwLock<HashMap<PathBuf, Arc<T>>>,
}

impl<T> Default for SchemaCache<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: DeserializeOwned> SchemaCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parsed document at `path`, loading it on first use
    pub fn get_or_load(&self, path: &Path) -> Result<Arc<T>> {
        let key = canonical(path)?;
        if let Some(found) = self.read_entries()?.get(&key) {
            return Ok(Arc::clone(found));
        }

        let text = std::fs::read_to_string(&key).map_err(|e| {
            ExtractError::config(format!("cannot read schema {}: {e}", key.display()))
        })?;
        let parsed: T = serde_json::from_str(&text).map_err(|e| {
            ExtractError::config(format!("cannot parse schema {}: {e}", key.display()))
        })?;
        debug!(path = %key.display(), "Loaded schema");

        let parsed = Arc::new(parsed);
        self.write_entries()?
            .entry(key)
            .or_insert_with(|| Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Drop the entry for `path` so the next lookup re-reads the file
    pub fn invalidate(&self, path: &Path) -> Result<bool> {
        let key = canonical(path)?;
        Ok(self.write_entries()?.remove(&key).is_some())
    }

    pub fn clear(&self) -> Result<()> {
        self.write_entries()?.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_entries(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<PathBuf, Arc<T>>>> {
        self.entries
            .read()
            .map_err(|_| ExtractError::config("schema cache lock poisoned"))
    }

    fn write_entries(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<PathBuf, Arc<T>>>> {
        self.entries
            .write()
            .map_err(|_| ExtractError::config("schema cache lock poisoned"))
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|e| ExtractError::config(format!("schema {}: {e}", path.display())))
}

/// Expected shape of a processed record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordSchema {
    pub fields: Vec<FieldSchema>,
    /// Fields not listed are accepted
    #[serde(default = "default_true")]
    pub allow_extra: bool,
    /// Schema for each child record of nested shapes
    #[serde(default)]
    pub children: Option<Box<RecordSchema>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub max_length: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl RecordSchema {
    /// First violation found, if any
    pub fn validate(&self, record: &Record) -> std::result::Result<(), String> {
        for field in &self.fields {
            match record.get(&field.name) {
                None if field.nullable => {},
                None => return Err(format!("field {} is missing", field.name)),
                Some(value) if value.kind() == ValueKind::Null => {
                    if !field.nullable {
                        return Err(format!("field {} must not be null", field.name));
                    }
                },
                Some(value) => {
                    if value.kind() != field.kind {
                        return Err(format!(
                            "field {} should be {:?} but is {:?}",
                            field.name,
                            field.kind,
                            value.kind()
                        ));
                    }
                    if let Some(max) = field.max_length {
                        let len = value.to_string().chars().count();
                        if len > max {
                            return Err(format!(
                                "field {} is {len} characters long, at most {max} allowed",
                                field.name
                            ));
                        }
                    }
                },
            }
        }

        if !self.allow_extra {
            if let Some(extra) = record
                .fields()
                .iter()
                .find(|f| !self.fields.iter().any(|s| s.name == f.name))
            {
                return Err(format!("unexpected field {}", extra.name));
            }
        }

        if let Some(child_schema) = &self.children {
            for (idx, child) in record.children().iter().enumerate() {
                child_schema
                    .validate(child)
                    .map_err(|e| format!("child {idx}: {e}"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::Value;
    use std::io::Write;

    const SCHEMA: &str = r#"{
        "fields": [
            {"name": "id", "kind": "integer"},
            {"name": "iban", "kind": "string", "max_length": 34},
            {"name": "note", "kind": "string", "nullable": true}
        ],
        "allow_extra": false
    }"#;

    fn schema() -> RecordSchema {
        serde_json::from_str(SCHEMA).unwrap()
    }

    #[test]
    fn test_valid_record() {
        let record = Record::from_pairs([
            ("id", Value::from(1i64)),
            ("iban", Value::from("DE89370400440532013000")),
            ("note", Value::Null),
        ])
        .unwrap();
        assert!(schema().validate(&record).is_ok());
    }

    #[test]
    fn test_violations() {
        let wrong_kind = Record::from_pairs([("id", "1"), ("iban", "x")]).unwrap();
        assert!(schema().validate(&wrong_kind).unwrap_err().contains("id"));

        let too_long =
            Record::from_pairs([("id", Value::from(1i64)), ("iban", Value::from("X".repeat(35)))])
                .unwrap();
        assert!(schema().validate(&too_long).unwrap_err().contains("34"));

        let extra = Record::from_pairs([
            ("id", Value::from(1i64)),
            ("iban", Value::from("x")),
            ("bic", Value::from("y")),
        ])
        .unwrap();
        assert!(schema().validate(&extra).unwrap_err().contains("bic"));
    }

    #[test]
    fn test_cache_loads_once_and_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.schema.json");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(SCHEMA.as_bytes())
            .unwrap();

        let cache: SchemaCache<RecordSchema> = SchemaCache::new();
        let first = cache.get_or_load(&path).unwrap();
        let second = cache.get_or_load(&dir.path().join(".").join("accounts.schema.json")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate(&path).unwrap());
        let third = cache.get_or_load(&path).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));

        cache.clear().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_missing_schema_is_config_error() {
        let cache: SchemaCache<RecordSchema> = SchemaCache::new();
        let err = cache.get_or_load(Path::new("/nonexistent/schema.json")).unwrap_err();
        assert!(matches!(err, ExtractError::Config(_)));
    }
}
