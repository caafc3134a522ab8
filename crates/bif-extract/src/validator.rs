//! Structural validation of a finalized interface file
//!
//! Re-reads the file in its declared encoding and checks that it is
//! well-formed and that the record count matches the trailer.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ExtractError, Result};
use crate::interface::EncodingConfig;
use crate::writer::delimited::{FieldMapping, TRAILER_MARKER};

pub struct ContentValidator {
    encoding: EncodingConfig,
    mapping: Option<Arc<FieldMapping>>,
}

fn invalid(message: impl Into<String>) -> ExtractError {
    ExtractError::ContentInvalid(message.into())
}

impl ContentValidator {
    /// `mapping` is required for delimited encodings
    pub fn new(encoding: EncodingConfig, mapping: Option<Arc<FieldMapping>>) -> Self {
        Self { encoding, mapping }
    }

    /// Number of records found in a valid file
    pub fn validate(&self, path: &Path) -> Result<u64> {
        let count = match &self.encoding {
            EncodingConfig::Xml {
                root,
                record,
                trailer_count_element,
                ..
            } => validate_xml(path, root, record, trailer_count_element)?,
            EncodingConfig::Delimited {
                header, trailer, ..
            } => {
                let mapping = self
                    .mapping
                    .as_deref()
                    .ok_or_else(|| ExtractError::config("delimited validation needs a field mapping"))?;
                let delimiter = self
                    .encoding
                    .delimiter_byte()
                    .ok_or_else(|| ExtractError::config("delimiter is empty"))?;
                validate_delimited(path, mapping, delimiter, *header, *trailer)?
            },
            EncodingConfig::JsonArray { count_field } => {
                validate_json(path, count_field.as_deref())?
            },
        };
        debug!(path = %path.display(), records = count, "Content validation passed");
        Ok(count)
    }
}

fn validate_xml(path: &Path, root: &str, record: &str, trailer: &str) -> Result<u64> {
    let mut reader = Reader::from_reader(BufReader::new(File::open(path)?));
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut seen_root = false;
    let mut in_trailer = false;
    let mut records = 0u64;
    let mut declared: Option<u64> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| invalid(format!("malformed markup at byte {}: {e}", reader.buffer_position())))?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                depth += 1;
                match depth {
                    1 if name == root && !seen_root => seen_root = true,
                    1 => return Err(invalid(format!("unexpected top-level element {name}"))),
                    2 if name == record => records += 1,
                    2 if name == trailer => in_trailer = true,
                    _ => {},
                }
            },
            Event::Empty(e) => {
                if depth == 1 && e.name().as_ref() == record.as_bytes() {
                    records += 1;
                }
            },
            Event::Text(e) => {
                if let Some(byte) = e.iter().find(|b| is_forbidden_byte(**b)) {
                    return Err(invalid(format!(
                        "character 0x{byte:02X} is not allowed in XML (near byte {})",
                        reader.buffer_position()
                    )));
                }
                if in_trailer {
                    let text = String::from_utf8_lossy(&e).trim().to_string();
                    declared = Some(
                        text.parse()
                            .map_err(|_| invalid(format!("trailer count {text:?} is not a number")))?,
                    );
                }
            },
            Event::End(_) => {
                in_trailer = false;
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| invalid("unbalanced closing element"))?;
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    if !seen_root {
        return Err(invalid(format!("root element {root} not found")));
    }
    if depth != 0 {
        return Err(invalid("document ends inside an open element"));
    }
    check_count(declared, records)
}

/// XML 1.0 allows no C0 controls besides tab, LF and CR. Multi-byte UTF-8
/// sequences never contain bytes below 0x80.
fn is_forbidden_byte(byte: u8) -> bool {
    byte < 0x20 && !matches!(byte, b'\t' | b'\n' | b'\r')
}

fn validate_delimited(
    path: &Path,
    mapping: &FieldMapping,
    delimiter: u8,
    header: bool,
    trailer: bool,
) -> Result<u64> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| invalid(e.to_string()))?;

    let width = mapping.columns.len();
    let mut rows = Vec::new();
    for row in reader.records() {
        rows.push(row.map_err(|e| invalid(format!("unreadable line: {e}")))?);
    }

    let mut body = rows.as_slice();
    if header {
        let (first, rest) = body
            .split_first()
            .ok_or_else(|| invalid("header line missing"))?;
        if first.len() != width {
            return Err(invalid(format!("header has {} fields, expected {width}", first.len())));
        }
        body = rest;
    }

    let mut declared = None;
    if trailer {
        let (last, rest) = body
            .split_last()
            .ok_or_else(|| invalid("trailer line missing"))?;
        if last.len() != 2 || last.get(0) != Some(TRAILER_MARKER) {
            return Err(invalid("last line is not a trailer"));
        }
        let count = last.get(1).unwrap_or_default();
        declared = Some(
            count
                .parse()
                .map_err(|_| invalid(format!("trailer count {count:?} is not a number")))?,
        );
        body = rest;
    }

    if let Some((idx, row)) = body.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(invalid(format!(
            "line {} has {} fields, expected {width}",
            idx + 1 + usize::from(header),
            row.len()
        )));
    }

    match declared {
        Some(_) => check_count(declared, body.len() as u64),
        None => Ok(body.len() as u64),
    }
}

fn validate_json(path: &Path, count_field: Option<&str>) -> Result<u64> {
    let document: serde_json::Value = serde_json::from_reader(BufReader::new(File::open(path)?))
        .map_err(|e| invalid(format!("malformed JSON: {e}")))?;

    match count_field {
        None => {
            let records = document
                .as_array()
                .ok_or_else(|| invalid("top level is not an array"))?;
            Ok(records.len() as u64)
        },
        Some(field) => {
            let records = document
                .get("records")
                .and_then(|r| r.as_array())
                .ok_or_else(|| invalid("records array missing"))?;
            let declared = document
                .get(field)
                .and_then(|c| c.as_u64())
                .ok_or_else(|| invalid(format!("count field {field} missing")))?;
            check_count(Some(declared), records.len() as u64)
        },
    }
}

fn check_count(declared: Option<u64>, actual: u64) -> Result<u64> {
    match declared {
        Some(declared) if declared == actual => Ok(actual),
        Some(declared) => Err(invalid(format!(
            "trailer declares {declared} records but the file contains {actual}"
        ))),
        None => Err(invalid("trailer count missing")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::writer::delimited::ColumnMapping;

    fn xml_validator() -> ContentValidator {
        ContentValidator::new(
            EncodingConfig::Xml {
                root: "Accounts".to_string(),
                record: "Account".to_string(),
                children_wrapper: None,
                child_record: "Item".to_string(),
                trailer_count_element: "TotalRecords".to_string(),
            },
            None,
        )
    }

    fn write(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_xml_valid() {
        let (_dir, path) = write(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Accounts>\n\
             <Account><id>1</id></Account>\n<Account><id>2</id></Account>\n\
             <TotalRecords>2</TotalRecords>\n</Accounts>\n",
        );
        assert_eq!(xml_validator().validate(&path).unwrap(), 2);
    }

    #[test]
    fn test_xml_count_mismatch() {
        let (_dir, path) = write(
            "<Accounts><Account><id>1</id></Account><TotalRecords>3</TotalRecords></Accounts>",
        );
        let err = xml_validator().validate(&path).unwrap_err();
        assert!(err.to_string().contains("declares 3"));
    }

    #[test]
    fn test_xml_truncated() {
        let (_dir, path) = write("<Accounts><Account><id>1</id></Account>");
        assert!(xml_validator().validate(&path).is_err());
    }

    #[test]
    fn test_xml_control_character_rejected() {
        let (_dir, path) = write(
            "<Accounts><Account><holder>Bad\u{1}Name</holder></Account>\
             <TotalRecords>1</TotalRecords></Accounts>",
        );
        let err = xml_validator().validate(&path).unwrap_err();
        assert!(err.to_string().contains("0x01"));
    }

    #[test]
    fn test_delimited() {
        let mapping = Arc::new(FieldMapping {
            columns: vec![
                ColumnMapping {
                    field: "id".to_string(),
                    header: None,
                    width: None,
                },
                ColumnMapping {
                    field: "name".to_string(),
                    header: None,
                    width: None,
                },
            ],
        });
        let validator = ContentValidator::new(
            EncodingConfig::Delimited {
                mapping_file: "unused.json".into(),
                delimiter: "|".to_string(),
                header: true,
                trailer: true,
            },
            Some(mapping),
        );

        let (_dir, good) = write("id|name\n1|a\n2|b\nTRAILER|2\n");
        assert_eq!(validator.validate(&good).unwrap(), 2);

        let (_dir2, bad) = write("id|name\n1|a|extra\nTRAILER|1\n");
        assert!(validator.validate(&bad).is_err());

        let (_dir3, miscounted) = write("id|name\n1|a\nTRAILER|5\n");
        assert!(validator.validate(&miscounted).is_err());
    }

    #[test]
    fn test_json_envelope() {
        let validator = ContentValidator::new(
            EncodingConfig::JsonArray {
                count_field: Some("total".to_string()),
            },
            None,
        );
        let (_dir, path) = write("{\"records\":[\n{\"id\":1}\n],\"total\":1}\n");
        assert_eq!(validator.validate(&path).unwrap(), 1);

        let (_dir2, wrong) = write("{\"records\":[],\"total\":1}");
        assert!(validator.validate(&wrong).is_err());
    }
}
