//! Delimited line encoding driven by an external field mapping
//!
//! ```json
//! {
//!   "columns": [
//!     { "field": "account_id", "header": "ACCOUNT" },
//!     { "field": "iban", "header": "IBAN", "width": 34 }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;

use super::RecordEncoder;
use crate::error::{ExtractError, Result};
use crate::record::Record;

/// Column layout of a delimited file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub columns: Vec<ColumnMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Record field providing the value
    pub field: String,
    /// Header label; defaults to the field name
    #[serde(default)]
    pub header: Option<String>,
    /// Fixed width: values are right-padded with spaces or truncated
    #[serde(default)]
    pub width: Option<usize>,
}

impl ColumnMapping {
    fn label(&self) -> &str {
        self.header.as_deref().unwrap_or(&self.field)
    }

    fn render(&self, record: &Record) -> String {
        let value = record
            .get(&self.field)
            .map(ToString::to_string)
            .unwrap_or_default();
        match self.width {
            Some(width) => format!("{:<width$.width$}", value),
            None => value,
        }
    }
}

pub const TRAILER_MARKER: &str = "TRAILER";

pub struct DelimitedEncoder {
    mapping: Arc<FieldMapping>,
    delimiter: u8,
    header: bool,
    trailer: bool,
}

impl DelimitedEncoder {
    pub fn new(mapping: Arc<FieldMapping>, delimiter: u8, header: bool, trailer: bool) -> Result<Self> {
        if mapping.columns.is_empty() {
            return Err(ExtractError::config("field mapping has no columns"));
        }
        Ok(Self {
            mapping,
            delimiter,
            header,
            trailer,
        })
    }

    fn write_line<I, S>(&self, fields: I, out: &mut dyn Write) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut line = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        line.write_record(fields)
            .map_err(|e| ExtractError::write(format!("delimited: {e}")))?;
        let bytes = line
            .into_inner()
            .map_err(|e| ExtractError::write(format!("delimited: {e}")))?;
        out.write_all(&bytes)?;
        Ok(())
    }
}

impl RecordEncoder for DelimitedEncoder {
    fn header(&self, out: &mut dyn Write) -> Result<()> {
        if self.header {
            self.write_line(self.mapping.columns.iter().map(ColumnMapping::label), out)?;
        }
        Ok(())
    }

    fn record(&self, record: &Record, _index: u64, out: &mut dyn Write) -> Result<()> {
        self.write_line(self.mapping.columns.iter().map(|c| c.render(record)), out)
    }

    fn footer(&self, total: u64, out: &mut dyn Write) -> Result<()> {
        if self.trailer {
            self.write_line([TRAILER_MARKER.to_string(), total.to_string()], out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::Value;

    fn mapping() -> Arc<FieldMapping> {
        Arc::new(
            serde_json::from_str(
                r#"{"columns": [
                    {"field": "id", "header": "ID"},
                    {"field": "name", "width": 6},
                    {"field": "note"}
                ]}"#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_layout_with_header_and_trailer() {
        let encoder = DelimitedEncoder::new(mapping(), b';', true, true).unwrap();
        let mut out = Vec::new();
        encoder.header(&mut out).unwrap();
        let record = Record::from_pairs([
            ("id", Value::from(1i64)),
            ("name", Value::from("Alexander")),
            ("note", Value::from("a;b")),
        ])
        .unwrap();
        encoder.record(&record, 0, &mut out).unwrap();
        let short = Record::from_pairs([("id", Value::from(2i64)), ("name", Value::from("Al"))]).unwrap();
        encoder.record(&short, 1, &mut out).unwrap();
        encoder.footer(2, &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "ID;name;note\n1;Alexan;\"a;b\"\n2;Al    ;\nTRAILER;2\n"
        );
    }

    #[test]
    fn test_empty_mapping_rejected() {
        let empty = Arc::new(FieldMapping { columns: vec![] });
        assert!(DelimitedEncoder::new(empty, b',', false, false).is_err());
    }
}
