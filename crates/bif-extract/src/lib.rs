//! BIF Extract Library
//!
//! Restart-safe extraction of database rows into banking interface files.
//!
//! # Overview
//!
//! One job extracts one interface into one output file:
//!
//! - **Reading**: [`reader::CursorReader`] pages through a [`source::RecordSource`]
//!   by strictly increasing key, fetching nested detail rows in bulk
//! - **Processing**: [`processor::RecordProcessor`] filters, normalises and
//!   validates each record
//! - **Writing**: [`writer::CheckpointedWriter`] appends encoded records to a
//!   provisional `.part` file and records durable byte offsets
//! - **Finalizing**: [`finalizer::Finalizer`] renames the file into place and
//!   writes its `.sha` sidecar
//! - **Status**: [`job::StatusMachine`] moves jobs through their lifecycle with
//!   optimistic concurrency
//!
//! [`orchestrator::PipelineOrchestrator`] drives one job through these stages
//! and [`launcher::JobLauncher`] runs jobs on a bounded worker pool.
//!
//! # Restart model
//!
//! After every chunk the reader's last key and the writer's byte offset are
//! saved together as a [`checkpoint::StepCheckpoint`]. A resumed job truncates
//! the provisional file to the saved offset and continues after the saved
//! key, so the final file is byte-identical to an uninterrupted run.
//!
//! # Example
//!
//! ```no_run
//! use bif_extract::{config::AppConfig, db, interface::InterfaceConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     db::migrate(&pool).await?;
//!     let interface = InterfaceConfig::from_file("interfaces/accounts.toml")?;
//!     println!("loaded {}", interface.interface_type);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod error;
pub mod finalizer;
pub mod interface;
pub mod job;
pub mod launcher;
pub mod orchestrator;
pub mod processor;
pub mod reader;
pub mod record;
pub mod retry;
pub mod schema;
pub mod source;
pub mod validator;
pub mod writer;

pub use error::{ExtractError, Result};
pub use finalizer::{FinalizeReport, FinalizeStatus, Finalizer};
pub use interface::InterfaceConfig;
pub use job::{JobRecord, JobStatus, StatusMachine};
pub use launcher::JobLauncher;
pub use orchestrator::{JobOutcome, PipelineOrchestrator};
pub use record::{Record, Value};
