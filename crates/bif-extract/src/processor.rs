//! Record filtering, normalisation and business validation

use sqlx::types::BigDecimal;
use std::sync::Arc;

use crate::error::{ExtractError, Result};
use crate::interface::ProcessingConfig;
use crate::record::{Record, Value};
use crate::schema::RecordSchema;

/// What happened to one record
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Normalised record to be written
    Accepted(Record),
    /// Dropped silently; counted as filtered
    Filtered,
    /// Failed the record schema; counted as invalid
    Invalid(String),
}

/// Stateless per-record processing. Business rule violations are returned as
/// [`ExtractError::Validation`] so the caller can count and skip them.
pub struct RecordProcessor {
    config: ProcessingConfig,
    schema: Option<Arc<RecordSchema>>,
}

impl RecordProcessor {
    pub fn new(config: ProcessingConfig, schema: Option<Arc<RecordSchema>>) -> Self {
        Self { config, schema }
    }

    pub fn process(&self, mut record: Record) -> Result<Outcome> {
        if record.is_empty() || record.is_blank() {
            return Ok(Outcome::Filtered);
        }

        record.trim_text();

        if self
            .config
            .filter_if_blank
            .iter()
            .any(|name| record.get(name).map_or(true, Value::is_blank))
        {
            return Ok(Outcome::Filtered);
        }

        check_characters(&record, "record")?;

        check_rules(
            &record,
            &self.config.required,
            &self.config.positive,
            "record",
        )?;

        if self.config.require_children && record.children().is_empty() {
            return Err(ExtractError::Validation(
                "record has no child records".to_string(),
            ));
        }

        for (idx, child) in record.children().iter().enumerate() {
            check_rules(
                child,
                &self.config.child_required,
                &self.config.child_positive,
                &format!("child {idx}"),
            )?;
        }

        if let Some(schema) = &self.schema {
            if let Err(reason) = schema.validate(&record) {
                return Ok(Outcome::Invalid(reason));
            }
        }

        Ok(Outcome::Accepted(record))
    }
}

/// C0 control characters other than tab, LF and CR cannot be carried by
/// every output encoding
fn is_forbidden_control(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}')
}

fn check_characters(record: &Record, what: &str) -> Result<()> {
    for field in record.fields() {
        if let Value::Text(text) = &field.value {
            if let Some(c) = text.chars().find(|c| is_forbidden_control(*c)) {
                return Err(ExtractError::Validation(format!(
                    "{what}: field {} contains control character U+{:04X}",
                    field.name, c as u32
                )));
            }
        }
    }
    for (idx, child) in record.children().iter().enumerate() {
        check_characters(child, &format!("{what} child {idx}"))?;
    }
    Ok(())
}

fn check_rules(record: &Record, required: &[String], positive: &[String], what: &str) -> Result<()> {
    for name in required {
        if record.get(name).map_or(true, Value::is_blank) {
            return Err(ExtractError::Validation(format!(
                "{what}: required field {name} is missing or blank"
            )));
        }
    }

    let zero = BigDecimal::from(0);
    for name in positive {
        match record.get(name).and_then(Value::as_decimal) {
            Some(amount) if amount > zero => {},
            Some(amount) => {
                return Err(ExtractError::Validation(format!(
                    "{what}: field {name} must be positive, got {amount}"
                )))
            },
            None => {
                return Err(ExtractError::Validation(format!(
                    "{what}: field {name} is not a number"
                )))
            },
        }
    }
    Ok(())
}
