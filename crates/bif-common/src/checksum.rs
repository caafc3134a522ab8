//! SHA-256 digests and the checksum sidecar line format
//!
//! Final interface files are accompanied by a `<name>.sha` sidecar whose only
//! content is a single line of the form `SHA256(<name>)= <64 lowercase hex>`.

use crate::error::{BifError, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

const SIDECAR_PREFIX: &str = "SHA256(";
const SIDECAR_SEPARATOR: &str = ")= ";

/// Compute the SHA-256 digest of any readable source, streaming in 8 KiB blocks
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 digest of a file
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    sha256_reader(&mut file)
}

/// Compute the SHA-256 digest of an in-memory buffer
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify a file against an expected hex digest (case-insensitive)
pub fn verify_file(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(BifError::ChecksumMismatch {
            file: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// One parsed sidecar line: `SHA256(<file_name>)= <hex>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarLine {
    pub file_name: String,
    pub hex_digest: String,
}

impl SidecarLine {
    pub fn new(file_name: impl Into<String>, hex_digest: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            hex_digest: hex_digest.into().to_ascii_lowercase(),
        }
    }

    /// Read and parse a sidecar file
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        content
            .parse()
            .map_err(|reason: String| BifError::MalformedSidecar {
                path: path.display().to_string(),
                reason,
            })
    }
}

impl fmt::Display for SidecarLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SIDECAR_PREFIX}{}{SIDECAR_SEPARATOR}{}",
            self.file_name, self.hex_digest
        )
    }
}

impl FromStr for SidecarLine {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let line = s.trim_end_matches(['\r', '\n']);
        let rest = line
            .strip_prefix(SIDECAR_PREFIX)
            .ok_or_else(|| "missing SHA256( prefix".to_string())?;
        let (file_name, digest) = rest
            .rsplit_once(SIDECAR_SEPARATOR)
            .ok_or_else(|| "missing ')= ' separator".to_string())?;

        if file_name.is_empty() {
            return Err("empty file name".to_string());
        }
        if digest.len() != SHA256_HEX_LEN || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("digest is not {SHA256_HEX_LEN} hex characters"));
        }

        Ok(Self {
            file_name: file_name.to_string(),
            hex_digest: digest.to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_reader() {
        let mut cursor = Cursor::new(b"hello world");
        assert_eq!(sha256_reader(&mut cursor).unwrap(), HELLO_WORLD);
    }

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_verify_file_is_case_insensitive() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        assert!(verify_file(file.path(), HELLO_WORLD).is_ok());
        assert!(verify_file(file.path(), &HELLO_WORLD.to_uppercase()).is_ok());
    }

    #[test]
    fn test_verify_file_mismatch() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world!").unwrap();
        file.flush().unwrap();

        let err = verify_file(file.path(), HELLO_WORLD).unwrap_err();
        assert!(matches!(err, BifError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_sidecar_format() {
        let line = SidecarLine::new("ACCOUNTS_20240101.xml", HELLO_WORLD.to_uppercase());
        assert_eq!(
            line.to_string(),
            format!("SHA256(ACCOUNTS_20240101.xml)= {HELLO_WORLD}")
        );
    }

    #[test]
    fn test_sidecar_parse_rejects_garbage() {
        assert!("".parse::<SidecarLine>().is_err());
        assert!("MD5(a)= abc".parse::<SidecarLine>().is_err());
        assert!("SHA256(a)= abc".parse::<SidecarLine>().is_err());
        assert!(format!("SHA256()= {HELLO_WORLD}").parse::<SidecarLine>().is_err());
    }

    #[test]
    fn test_sidecar_parse_tolerates_trailing_newline() {
        let parsed: SidecarLine = format!("SHA256(a.csv)= {HELLO_WORLD}\n").parse().unwrap();
        assert_eq!(parsed.file_name, "a.csv");
        assert_eq!(parsed.hex_digest, HELLO_WORLD);
    }

    proptest! {
        #[test]
        fn sidecar_line_parses_back(name in "[A-Za-z0-9_.()-]{1,40}", data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let line = SidecarLine::new(name.clone(), sha256_bytes(&data));
            let parsed: SidecarLine = line.to_string().parse().unwrap();
            prop_assert_eq!(parsed, line);
        }
    }
}
