//! BIF Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and checksum utilities for the BIF
//! workspace members.
//!
//! - **Error Handling**: [`BifError`] and the [`Result`] alias
//! - **Checksums**: streaming SHA-256 digests and the `.sha` sidecar format
//! - **Logging**: `tracing` subscriber initialisation driven by environment
//!
//! # Example
//!
//! ```no_run
//! use bif_common::checksum::{sha256_file, SidecarLine};
//!
//! fn describe(path: &std::path::Path) -> bif_common::Result<String> {
//!     let digest = sha256_file(path)?;
//!     Ok(SidecarLine::new("ACCOUNTS.xml", digest).to_string())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{BifError, Result};
