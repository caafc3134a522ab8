//! Per-interface extraction configuration
//!
//! One [`InterfaceConfig`] describes everything a job needs: where the rows
//! come from, how records are validated, and how the output file is encoded.
//! It is loaded once, validated, and then shared read-only by every job of
//! that interface type.
//!
//! ```toml
//! interface_type = "ACCOUNTS"
//! file_name = "ACCOUNTS_{date}.xml"
//!
//! [source]
//! table = "export.accounts"
//! key_column = "account_id"
//! page_size = 1000
//!
//! [processing]
//! chunk_size = 100
//! skip_limit = 10
//! required = ["iban", "balance"]
//!
//! [output.encoding]
//! format = "xml"
//! root = "Accounts"
//! record = "Account"
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ExtractError, Result};

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_SKIP_LIMIT: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub interface_type: String,
    /// Final file name; `{date}` and `{timestamp}` are expanded at job creation
    pub file_name: String,
    /// Overrides the application-wide output directory
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    pub source: SourceConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Table or view holding one row per (parent) record
    pub table: String,
    /// Single numeric column the cursor orders and resumes on
    pub key_column: String,
    /// Explicit projection; empty means every column
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub shape: SourceShape,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceShape {
    #[default]
    Flat,
    /// Parent rows with nested children, fetched in two phases
    Nested {
        /// View joining parent and child columns, one row per child
        detail_table: String,
        /// Columns of the joined row that belong to the child
        child_columns: Vec<String>,
        /// Collection name used by encoders for the children
        children_name: String,
        /// Order of children within a parent; defaults to `child_columns`
        #[serde(default)]
        child_order: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Maximum number of records skipped for validation errors
    #[serde(default = "default_skip_limit")]
    pub skip_limit: u64,
    /// A blank value in any of these drops the record silently
    #[serde(default)]
    pub filter_if_blank: Vec<String>,
    /// A blank value in any of these skips the record as invalid content
    #[serde(default)]
    pub required: Vec<String>,
    /// Numeric fields that must be strictly greater than zero
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub child_required: Vec<String>,
    #[serde(default)]
    pub child_positive: Vec<String>,
    /// Parents without children fail validation
    #[serde(default)]
    pub require_children: bool,
    /// JSON record schema checked after the business rules
    #[serde(default)]
    pub record_schema: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub encoding: EncodingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum EncodingConfig {
    /// Structured markup: one element per record inside a root element
    Xml {
        root: String,
        record: String,
        /// Element wrapping a record's children, e.g. `LineItems`
        #[serde(default)]
        children_wrapper: Option<String>,
        #[serde(default = "default_child_record")]
        child_record: String,
        #[serde(default = "default_trailer_count_element")]
        trailer_count_element: String,
    },
    /// Delimited lines laid out by an external field mapping file
    Delimited {
        mapping_file: PathBuf,
        #[serde(default = "default_delimiter")]
        delimiter: String,
        #[serde(default)]
        header: bool,
        #[serde(default)]
        trailer: bool,
    },
    /// A JSON array of objects, optionally wrapped with a record count
    JsonArray {
        #[serde(default)]
        count_field: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Re-read and validate the finalized file before completing the job
    #[serde(default)]
    pub content: bool,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_skip_limit() -> u64 {
    DEFAULT_SKIP_LIMIT
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_child_record() -> String {
    "Item".to_string()
}

fn default_trailer_count_element() -> String {
    "TotalRecords".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip_limit: DEFAULT_SKIP_LIMIT,
            filter_if_blank: Vec::new(),
            required: Vec::new(),
            positive: Vec::new(),
            child_required: Vec::new(),
            child_positive: Vec::new(),
            require_children: false,
            record_schema: None,
        }
    }
}

impl EncodingConfig {
    /// The single delimiter byte of a delimited encoding
    pub fn delimiter_byte(&self) -> Option<u8> {
        match self {
            EncodingConfig::Delimited { delimiter, .. } => delimiter.as_bytes().first().copied(),
            _ => None,
        }
    }
}

impl InterfaceConfig {
    /// Load from a TOML file. Relative mapping and schema paths are resolved
    /// against the directory of the file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .build()
            .map_err(|e| ExtractError::config(format!("{}: {e}", path.display())))?;

        let mut interface: InterfaceConfig = settings
            .try_deserialize()
            .map_err(|e| ExtractError::config(format!("{}: {e}", path.display())))?;

        if let Some(base) = path.parent() {
            interface.resolve_relative_paths(base);
        }
        interface.validate()?;
        Ok(interface)
    }

    /// Parse from TOML text without touching the filesystem
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let interface: InterfaceConfig = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ExtractError::config(e.to_string()))?;
        interface.validate()?;
        Ok(interface)
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        if let EncodingConfig::Delimited { mapping_file, .. } = &mut self.output.encoding {
            if mapping_file.is_relative() {
                *mapping_file = base.join(&*mapping_file);
            }
        }
        if let Some(schema) = &mut self.processing.record_schema {
            if schema.is_relative() {
                *schema = base.join(&*schema);
            }
        }
    }

    /// Output directory for this interface, falling back to the global one
    pub fn output_dir_or<'a>(&'a self, default: &'a Path) -> &'a Path {
        self.output_dir.as_deref().unwrap_or(default)
    }

    /// Expand the file name template for a job created at `now`
    pub fn render_file_name(&self, now: DateTime<Utc>) -> String {
        self.file_name
            .replace("{date}", &now.format("%Y%m%d").to_string())
            .replace("{timestamp}", &now.format("%Y%m%d%H%M%S").to_string())
    }

    pub fn children_name(&self) -> Option<&str> {
        match &self.source.shape {
            SourceShape::Flat => None,
            SourceShape::Nested { children_name, .. } => Some(children_name),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface_type.trim().is_empty() {
            return Err(ExtractError::config("interface_type cannot be empty"));
        }
        if self.file_name.trim().is_empty()
            || self.file_name.contains('/')
            || self.file_name.contains('\\')
            || self.file_name.contains("..")
        {
            return Err(ExtractError::config(format!(
                "file_name {:?} must be a plain file name",
                self.file_name
            )));
        }

        check_identifier("source.table", &self.source.table)?;
        check_identifier("source.key_column", &self.source.key_column)?;
        for column in &self.source.columns {
            check_identifier("source.columns", column)?;
        }
        if !self.source.columns.is_empty() && !self.source.columns.contains(&self.source.key_column)
        {
            return Err(ExtractError::config(
                "source.columns must include the key column",
            ));
        }
        if self.source.page_size == 0 {
            return Err(ExtractError::config("source.page_size must be greater than 0"));
        }
        if self.source.retry.max_attempts == 0 {
            return Err(ExtractError::config(
                "source.retry.max_attempts must be at least 1",
            ));
        }
        if self.processing.chunk_size == 0 {
            return Err(ExtractError::config(
                "processing.chunk_size must be greater than 0",
            ));
        }

        if let SourceShape::Nested {
            detail_table,
            child_columns,
            children_name,
            child_order,
        } = &self.source.shape
        {
            check_identifier("source.shape.detail_table", detail_table)?;
            if child_columns.is_empty() {
                return Err(ExtractError::config(
                    "nested shape needs at least one child column",
                ));
            }
            for column in child_columns {
                check_identifier("source.shape.child_columns", column)?;
                if *column == self.source.key_column {
                    return Err(ExtractError::config(
                        "the key column cannot be a child column",
                    ));
                }
            }
            for column in child_order {
                check_identifier("source.shape.child_order", column)?;
            }
            check_xml_name("source.shape.children_name", children_name)?;
        }

        match &self.output.encoding {
            EncodingConfig::Xml {
                root,
                record,
                children_wrapper,
                child_record,
                trailer_count_element,
            } => {
                check_xml_name("output.encoding.root", root)?;
                check_xml_name("output.encoding.record", record)?;
                check_xml_name("output.encoding.child_record", child_record)?;
                check_xml_name(
                    "output.encoding.trailer_count_element",
                    trailer_count_element,
                )?;
                if let Some(wrapper) = children_wrapper {
                    check_xml_name("output.encoding.children_wrapper", wrapper)?;
                }
            },
            EncodingConfig::Delimited { delimiter, .. } => {
                if delimiter.len() != 1 || !delimiter.is_ascii() {
                    return Err(ExtractError::config(
                        "output.encoding.delimiter must be a single ASCII character",
                    ));
                }
                if self.children_name().is_some() {
                    return Err(ExtractError::config(
                        "delimited encoding cannot represent a nested source shape",
                    ));
                }
            },
            EncodingConfig::JsonArray { count_field } => {
                if let Some(field) = count_field {
                    if field.trim().is_empty() {
                        return Err(ExtractError::config(
                            "output.encoding.count_field cannot be empty",
                        ));
                    }
                }
            },
        }

        Ok(())
    }
}

/// SQL identifiers are interpolated into queries, so only plain
/// `name` or `schema.name` forms are accepted.
fn check_identifier(what: &str, ident: &str) -> Result<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = ident.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(())
    } else {
        Err(ExtractError::config(format!(
            "{what}: {ident:?} is not a valid SQL identifier"
        )))
    }
}

fn check_xml_name(what: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.to_ascii_lowercase().starts_with("xml");
    if valid {
        Ok(())
    } else {
        Err(ExtractError::config(format!(
            "{what}: {name:?} is not a valid element name"
        )))
    }
}
