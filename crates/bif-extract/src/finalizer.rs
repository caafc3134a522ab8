//! Promotion of a provisional file to its final name with a checksum sidecar
//!
//! The final artifact and its `.sha` sidecar appear together or not at all:
//! the data file is renamed first, the sidecar is written under a provisional
//! name and renamed once complete. A caller that sees any non-success status
//! must fail the job. If the report shows the file was renamed, the caller
//! removes it with [`Finalizer::cleanup`]; otherwise only the provisional
//! leftovers go, through [`Finalizer::discard_provisional`].
//!
//! When the provisional and final paths live on different filesystems the
//! rename cannot be atomic and a copy-then-delete is used instead. A crash in
//! the middle of that copy can leave a partial final file without a sidecar,
//! which recovery detects through a failing [`Finalizer::verify`].

use bif_common::checksum::{sha256_file, SidecarLine};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{ExtractError, Result};

/// Marker appended to the final file name while the file is being written
pub const PROVISIONAL_SUFFIX: &str = ".part";

/// Extension of the checksum sidecar
pub const SIDECAR_SUFFIX: &str = ".sha";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalizeStatus {
    Success,
    /// Provisional file missing or not a regular file; not retryable
    InvalidPartFile,
    ShaGenerationFailed,
    IoError,
    /// Path escapes the output directory or access was denied
    SecurityError,
}

impl fmt::Display for FinalizeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalizeStatus::Success => "SUCCESS",
            FinalizeStatus::InvalidPartFile => "INVALID_PART_FILE",
            FinalizeStatus::ShaGenerationFailed => "SHA_GENERATION_FAILED",
            FinalizeStatus::IoError => "IO_ERROR",
            FinalizeStatus::SecurityError => "SECURITY_ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub status: FinalizeStatus,
    /// Set once the provisional file has been moved to its final name
    pub final_path: Option<PathBuf>,
    pub sidecar_path: Option<PathBuf>,
    pub digest: Option<String>,
    /// False when the copy fallback was used
    pub atomic: bool,
    pub message: String,
}

impl FinalizeReport {
    fn failed(status: FinalizeStatus, final_path: Option<PathBuf>, message: String) -> Self {
        Self {
            status,
            final_path,
            sidecar_path: None,
            digest: None,
            atomic: false,
            message,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == FinalizeStatus::Success
    }

    /// Whether this call put a file under the final name
    pub fn renamed(&self) -> bool {
        self.final_path.is_some()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ExtractError::Finalize {
                status: self.status,
                reason: self.message,
            })
        }
    }
}

/// Path of the provisional file for a final artifact
pub fn provisional_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, PROVISIONAL_SUFFIX)
}

/// Path of the checksum sidecar for a final artifact
pub fn sidecar_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, SIDECAR_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct Finalizer {
    output_dir: PathBuf,
}

impl Finalizer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Rename `provisional` to its final name and write the sidecar
    pub fn finalize(&self, provisional: &Path) -> FinalizeReport {
        let final_path = match self.final_path_for(provisional) {
            Ok(path) => path,
            Err(report) => return report,
        };

        match fs::metadata(provisional) {
            Ok(meta) if meta.is_file() => {},
            Ok(_) => {
                return FinalizeReport::failed(
                    FinalizeStatus::InvalidPartFile,
                    None,
                    format!("{} is not a regular file", provisional.display()),
                )
            },
            Err(e) => {
                return FinalizeReport::failed(
                    FinalizeStatus::InvalidPartFile,
                    None,
                    format!("provisional file {}: {e}", provisional.display()),
                )
            },
        }

        if final_path.exists() {
            return FinalizeReport::failed(
                FinalizeStatus::IoError,
                None,
                format!("final file {} already exists", final_path.display()),
            );
        }

        let atomic = match move_file(provisional, &final_path) {
            Ok(atomic) => atomic,
            Err(e) => {
                let status = if e.kind() == ErrorKind::PermissionDenied {
                    FinalizeStatus::SecurityError
                } else {
                    FinalizeStatus::IoError
                };
                return FinalizeReport::failed(
                    status,
                    None,
                    format!(
                        "cannot move {} to {}: {e}",
                        provisional.display(),
                        final_path.display()
                    ),
                );
            },
        };
        if !atomic {
            warn!(
                final_path = %final_path.display(),
                "Provisional and final paths are on different filesystems; used non-atomic copy"
            );
        }

        match write_sidecar(&final_path) {
            Ok((sidecar, digest)) => {
                info!(
                    final_path = %final_path.display(),
                    sha256 = %digest,
                    atomic,
                    "Finalized interface file"
                );
                FinalizeReport {
                    status: FinalizeStatus::Success,
                    final_path: Some(final_path),
                    sidecar_path: Some(sidecar),
                    digest: Some(digest),
                    atomic,
                    message: "finalized".to_string(),
                }
            },
            Err(e) => {
                let mut report = FinalizeReport::failed(
                    FinalizeStatus::ShaGenerationFailed,
                    Some(final_path.clone()),
                    format!("checksum for {}: {e}", final_path.display()),
                );
                report.atomic = atomic;
                report
            },
        }
    }

    /// Recompute the digest of `final_path` and compare it with its sidecar
    pub fn verify(&self, final_path: &Path) -> bool {
        match self.check_sidecar(final_path) {
            Ok(()) => true,
            Err(e) => {
                warn!(final_path = %final_path.display(), error = %e, "Checksum verification failed");
                false
            },
        }
    }

    fn check_sidecar(&self, final_path: &Path) -> Result<()> {
        let sidecar = SidecarLine::read_from(sidecar_path(final_path))?;
        let expected_name = file_name(final_path)?;
        if sidecar.file_name != expected_name {
            return Err(ExtractError::ContentInvalid(format!(
                "sidecar names {} instead of {expected_name}",
                sidecar.file_name
            )));
        }
        bif_common::checksum::verify_file(final_path, &sidecar.hex_digest)?;
        Ok(())
    }

    /// Remove the final artifact, its sidecar and any provisional leftovers.
    /// Only for artifacts this job renamed into place.
    pub fn cleanup(&self, final_path: &Path) -> Result<()> {
        let sidecar = sidecar_path(final_path);
        remove_all(&[
            final_path.to_path_buf(),
            sidecar.clone(),
            provisional_path(&sidecar),
            provisional_path(final_path),
        ])
    }

    /// Remove the provisional file and a staging sidecar, leaving whatever
    /// already sits under the final name untouched
    pub fn discard_provisional(&self, final_path: &Path) -> Result<()> {
        remove_all(&[
            provisional_path(&sidecar_path(final_path)),
            provisional_path(final_path),
        ])
    }

    /// The provisional file must live directly in the output directory and
    /// carry the provisional suffix
    fn final_path_for(&self, provisional: &Path) -> std::result::Result<PathBuf, FinalizeReport> {
        let security = |message: String| {
            FinalizeReport::failed(FinalizeStatus::SecurityError, None, message)
        };

        let name = provisional
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| security(format!("{} has no file name", provisional.display())))?;
        let final_name = name
            .strip_suffix(PROVISIONAL_SUFFIX)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                FinalizeReport::failed(
                    FinalizeStatus::InvalidPartFile,
                    None,
                    format!("{name} does not end with {PROVISIONAL_SUFFIX}"),
                )
            })?;

        let parent = provisional
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let output_dir = self
            .output_dir
            .canonicalize()
            .map_err(|e| security(format!("output directory {}: {e}", self.output_dir.display())))?;
        let parent = parent
            .canonicalize()
            .map_err(|e| security(format!("directory of {}: {e}", provisional.display())))?;
        if parent != output_dir {
            return Err(security(format!(
                "{} is outside the output directory {}",
                provisional.display(),
                output_dir.display()
            )));
        }

        Ok(parent.join(final_name))
    }
}

fn remove_all(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed artifact"),
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| ExtractError::write(format!("{} has no file name", path.display())))
}

/// Rename, falling back to copy and delete across filesystems.
/// Returns whether the move was atomic.
fn move_file(from: &Path, to: &Path) -> std::io::Result<bool> {
    match fs::rename(from, to) {
        Ok(()) => {
            sync_parent(to);
            Ok(true)
        },
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            let copied = fs::copy(from, to).and_then(|_| File::open(to)?.sync_all());
            if let Err(e) = copied {
                // a partial copy is ours to remove
                let _ = fs::remove_file(to);
                return Err(e);
            }
            fs::remove_file(from)?;
            sync_parent(to);
            Ok(false)
        },
        Err(e) => Err(e),
    }
}

fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(dir = %parent.display(), error = %e, "Directory sync not supported");
        }
    }
}

/// Digest the final file and publish `<final>.sha` via a provisional name
fn write_sidecar(final_path: &Path) -> Result<(PathBuf, String)> {
    let digest = sha256_file(final_path)?;
    let line = SidecarLine::new(file_name(final_path)?, digest.clone());

    let sidecar = sidecar_path(final_path);
    let staging = provisional_path(&sidecar);
    {
        let mut file = File::create(&staging)?;
        file.write_all(line.to_string().as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&staging, &sidecar)?;
    sync_parent(&sidecar);
    Ok((sidecar, digest))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use bif_common::checksum::sha256_bytes;

    fn setup(content: &[u8]) -> (tempfile::TempDir, Finalizer, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let finalizer = Finalizer::new(dir.path());
        let provisional = dir.path().join("ACCOUNTS_20240301.xml.part");
        fs::write(&provisional, content).unwrap();
        (dir, finalizer, provisional)
    }

    #[test]
    fn test_finalize_writes_sidecar() {
        let (dir, finalizer, provisional) = setup(b"<Accounts/>\n");
        let report = finalizer.finalize(&provisional);

        assert_eq!(report.status, FinalizeStatus::Success, "{}", report.message);
        assert!(report.atomic);
        let final_path = report.final_path.unwrap();
        assert_eq!(final_path.file_name().unwrap(), "ACCOUNTS_20240301.xml");
        assert!(!provisional.exists());

        let sidecar = fs::read_to_string(dir.path().join("ACCOUNTS_20240301.xml.sha")).unwrap();
        assert_eq!(
            sidecar,
            format!("SHA256(ACCOUNTS_20240301.xml)= {}", sha256_bytes(b"<Accounts/>\n"))
        );
        assert!(!dir.path().join("ACCOUNTS_20240301.xml.sha.part").exists());
        assert!(finalizer.verify(&final_path));
    }

    #[test]
    fn test_verify_detects_single_byte_change() {
        let (_dir, finalizer, provisional) = setup(b"0123456789");
        let final_path = finalizer.finalize(&provisional).final_path.unwrap();

        let mut bytes = fs::read(&final_path).unwrap();
        bytes[4] ^= 0x01;
        fs::write(&final_path, bytes).unwrap();
        assert!(!finalizer.verify(&final_path));
    }

    #[test]
    fn test_verify_accepts_uppercase_digest() {
        let (dir, finalizer, provisional) = setup(b"abc");
        let final_path = finalizer.finalize(&provisional).final_path.unwrap();
        let sidecar = dir.path().join("ACCOUNTS_20240301.xml.sha");
        let upper = fs::read_to_string(&sidecar)
            .unwrap()
            .replace(&sha256_bytes(b"abc"), &sha256_bytes(b"abc").to_uppercase());
        fs::write(&sidecar, upper).unwrap();
        assert!(finalizer.verify(&final_path));
    }

    #[test]
    fn test_missing_provisional_is_invalid_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let finalizer = Finalizer::new(dir.path());
        let report = finalizer.finalize(&dir.path().join("NOPE.xml.part"));
        assert_eq!(report.status, FinalizeStatus::InvalidPartFile);
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_outside_output_dir_is_security_error() {
        let other = tempfile::tempdir().unwrap();
        let provisional = other.path().join("EVIL.xml.part");
        fs::write(&provisional, b"x").unwrap();

        let (_dir, finalizer, _) = setup(b"x");
        let report = finalizer.finalize(&provisional);
        assert_eq!(report.status, FinalizeStatus::SecurityError);
        assert!(provisional.exists());
    }

    #[test]
    fn test_existing_final_file_is_not_overwritten() {
        let (dir, finalizer, provisional) = setup(b"new");
        fs::write(dir.path().join("ACCOUNTS_20240301.xml"), b"old").unwrap();
        fs::write(dir.path().join("ACCOUNTS_20240301.xml.sha"), b"old sidecar").unwrap();
        let report = finalizer.finalize(&provisional);
        assert_eq!(report.status, FinalizeStatus::IoError);
        assert!(!report.renamed());
        assert_eq!(fs::read(dir.path().join("ACCOUNTS_20240301.xml")).unwrap(), b"old");

        finalizer
            .discard_provisional(&dir.path().join("ACCOUNTS_20240301.xml"))
            .unwrap();
        assert!(!provisional.exists());
        assert_eq!(fs::read(dir.path().join("ACCOUNTS_20240301.xml")).unwrap(), b"old");
        assert_eq!(
            fs::read(dir.path().join("ACCOUNTS_20240301.xml.sha")).unwrap(),
            b"old sidecar"
        );
    }

    #[test]
    fn test_cleanup_removes_everything() {
        let (dir, finalizer, provisional) = setup(b"data");
        let final_path = finalizer.finalize(&provisional).final_path.unwrap();
        fs::write(dir.path().join("ACCOUNTS_20240301.xml.sha.part"), b"x").unwrap();

        finalizer.cleanup(&final_path).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        // idempotent
        finalizer.cleanup(&final_path).unwrap();
    }
}
