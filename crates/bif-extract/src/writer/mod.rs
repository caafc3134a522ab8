//! Restartable, checkpointed output writing
//!
//! The provisional file is written through
//! `BufWriter<ByteTrackingSink<File>>`. A checkpoint flushes the buffer and
//! syncs the file, so the tracked position is then exactly the durable file
//! size. A restarted writer truncates the file back to the checkpointed
//! offset before appending, which discards whatever a crashed run wrote after
//! its last checkpoint.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpointable, WriterCheckpoint};
use crate::error::{ExtractError, Result};
use crate::interface::{EncodingConfig, InterfaceConfig};
use crate::record::Record;
use crate::schema::SchemaCache;

pub mod delimited;
pub mod json;
pub mod sink;
pub mod xml;

pub use delimited::{DelimitedEncoder, FieldMapping};
pub use json::JsonArrayEncoder;
pub use sink::ByteTrackingSink;
pub use xml::XmlEncoder;

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Output format strategy, chosen once per job
pub trait RecordEncoder: Send + Sync {
    /// Written once when a fresh file is created
    fn header(&self, out: &mut dyn Write) -> Result<()>;

    /// `index` is the zero-based position of the record in the whole file.
    /// Output must depend only on the record and its index.
    fn record(&self, record: &Record, index: u64, out: &mut dyn Write) -> Result<()>;

    /// Written once on successful close
    fn footer(&self, total: u64, out: &mut dyn Write) -> Result<()>;
}

/// Resolve the configured encoding into an encoder
pub fn encoder_for(
    interface: &InterfaceConfig,
    mappings: &SchemaCache<FieldMapping>,
) -> Result<Box<dyn RecordEncoder>> {
    let children_name = interface.children_name().map(str::to_string);
    let encoder: Box<dyn RecordEncoder> = match &interface.output.encoding {
        EncodingConfig::Xml {
            root,
            record,
            children_wrapper,
            child_record,
            trailer_count_element,
        } => Box::new(XmlEncoder::new(
            root.as_str(),
            record.as_str(),
            children_wrapper.clone().or(children_name),
            child_record.as_str(),
            trailer_count_element.as_str(),
        )),
        EncodingConfig::Delimited {
            mapping_file,
            header,
            trailer,
            ..
        } => {
            let delimiter = interface
                .output
                .encoding
                .delimiter_byte()
                .ok_or_else(|| ExtractError::config("delimiter is empty"))?;
            Box::new(DelimitedEncoder::new(
                mappings.get_or_load(mapping_file)?,
                delimiter,
                *header,
                *trailer,
            )?)
        },
        EncodingConfig::JsonArray { count_field } => {
            Box::new(JsonArrayEncoder::new(count_field.clone(), children_name))
        },
    };
    Ok(encoder)
}

/// Streams encoded records into the provisional file.
///
/// Owned by exactly one job; all methods take `&mut self`, so header, records
/// and footer can never interleave.
pub struct CheckpointedWriter {
    path: PathBuf,
    encoder: Box<dyn RecordEncoder>,
    out: Option<BufWriter<ByteTrackingSink<File>>>,
    record_count: u64,
    last_checkpoint: WriterCheckpoint,
}

impl std::fmt::Debug for CheckpointedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointedWriter")
            .field("path", &self.path)
            .field("record_count", &self.record_count)
            .field("last_checkpoint", &self.last_checkpoint)
            .finish()
    }
}

impl CheckpointedWriter {
    /// Start a new file, or continue one from `checkpoint`.
    ///
    /// Continuing requires the file to be at least as long as the
    /// checkpointed offset; anything beyond it is cut off.
    pub fn open(
        path: impl AsRef<Path>,
        encoder: Box<dyn RecordEncoder>,
        checkpoint: Option<WriterCheckpoint>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        match checkpoint {
            None => {
                let file = File::create(&path)?;
                let mut writer = Self {
                    path,
                    encoder,
                    out: Some(BufWriter::with_capacity(
                        WRITE_BUFFER_SIZE,
                        ByteTrackingSink::new(file, 0),
                    )),
                    record_count: 0,
                    last_checkpoint: WriterCheckpoint::default(),
                };
                let out = writer
                    .out
                    .as_mut()
                    .ok_or_else(|| ExtractError::write("writer is closed"))?;
                writer.encoder.header(out)?;
                debug!(path = %writer.path.display(), "Created provisional file");
                Ok(writer)
            },
            Some(state) => {
                let file = OpenOptions::new().write(true).open(&path).map_err(|e| {
                    ExtractError::write(format!(
                        "cannot reopen provisional file {}: {e}",
                        path.display()
                    ))
                })?;
                let mut writer = Self {
                    path,
                    encoder,
                    out: Some(BufWriter::with_capacity(
                        WRITE_BUFFER_SIZE,
                        ByteTrackingSink::new(file, state.offset),
                    )),
                    record_count: state.record_count,
                    last_checkpoint: state,
                };
                writer.restore(state)?;
                info!(
                    path = %writer.path.display(),
                    offset = state.offset,
                    record_count = state.record_count,
                    "Resumed provisional file from checkpoint"
                );
                Ok(writer)
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    pub fn last_checkpoint(&self) -> WriterCheckpoint {
        self.last_checkpoint
    }

    /// Encode `records` in order
    pub fn write(&mut self, records: &[Record]) -> Result<()> {
        let mut index = self.record_count;
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| ExtractError::write("writer is closed"))?;
        for record in records {
            self.encoder.record(record, index, out)?;
            index += 1;
        }
        self.record_count = index;
        Ok(())
    }

    /// Finish the file.
    ///
    /// On success the footer is written and the file synced; the final size
    /// is returned. Otherwise buffered output is discarded and the file is
    /// cut back to the last checkpoint so a later run can resume it.
    pub fn close(mut self, success: bool) -> Result<u64> {
        if success {
            let total = self.record_count;
            let out = self
                .out
                .as_mut()
                .ok_or_else(|| ExtractError::write("writer is closed"))?;
            self.encoder.footer(total, out)?;
            out.flush()?;
            let size = out.get_ref().position();
            out.get_ref().get_ref().sync_all()?;
            debug!(path = %self.path.display(), records = total, size, "Closed provisional file");
            Ok(size)
        } else {
            let offset = self.last_checkpoint.offset;
            let out = self
                .out
                .take()
                .ok_or_else(|| ExtractError::write("writer is closed"))?;
            let (sink, discarded) = out.into_parts();
            let discarded = discarded.map(|b| b.len()).unwrap_or(0);
            let file = sink.into_inner();
            file.set_len(offset)?;
            file.sync_all()?;
            warn!(
                path = %self.path.display(),
                offset,
                discarded_bytes = discarded,
                "Closed provisional file without finishing; kept up to last checkpoint"
            );
            Ok(offset)
        }
    }

    fn out_mut(&mut self) -> Result<&mut BufWriter<ByteTrackingSink<File>>> {
        self.out
            .as_mut()
            .ok_or_else(|| ExtractError::write("writer is closed"))
    }
}

impl Checkpointable for CheckpointedWriter {
    type State = WriterCheckpoint;

    fn checkpoint(&mut self) -> Result<WriterCheckpoint> {
        let record_count = self.record_count;
        let out = self.out_mut()?;
        out.flush()?;
        out.get_ref().get_ref().sync_data()?;
        let state = WriterCheckpoint {
            offset: out.get_ref().position(),
            record_count,
        };
        self.last_checkpoint = state;
        Ok(state)
    }

    fn restore(&mut self, state: WriterCheckpoint) -> Result<()> {
        let out = self
            .out
            .take()
            .ok_or_else(|| ExtractError::write("writer is closed"))?;
        let (sink, _) = out.into_parts();
        let mut file = sink.into_inner();

        let size = file.metadata()?.len();
        if size < state.offset {
            return Err(ExtractError::write(format!(
                "provisional file {} is {size} bytes, shorter than checkpoint offset {}",
                self.path.display(),
                state.offset
            )));
        }
        if size > state.offset {
            debug!(
                path = %self.path.display(),
                size,
                offset = state.offset,
                "Truncating bytes written after the checkpoint"
            );
        }
        file.set_len(state.offset)?;
        file.seek(SeekFrom::Start(state.offset))?;
        file.sync_data()?;

        self.out = Some(BufWriter::with_capacity(
            WRITE_BUFFER_SIZE,
            ByteTrackingSink::new(file, state.offset),
        ));
        self.record_count = state.record_count;
        self.last_checkpoint = state;
        Ok(())
    }
}
