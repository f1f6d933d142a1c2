//! Content digests for remote sidecar files.
//!
//! A sidecar (`<remote file>.hash`) holds the lowercase hex digest of the
//! uploaded bytes. MD5 is the default; SHA-256 and BLAKE3 are available.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!(
                "unknown hash algorithm '{}' (expected md5, sha256 or blake3)",
                other
            )),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Compare against the text of a sidecar file.
    ///
    /// Surrounding whitespace and hex case are ignored.
    pub fn matches_sidecar(&self, sidecar: &str) -> bool {
        self.hex.eq_ignore_ascii_case(sidecar.trim())
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

enum Hasher {
    Md5(md5::Context),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(<sha2::Sha256 as sha2::Digest>::new()),
            ChecksumAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha256(hasher) => sha2::Digest::update(hasher, data),
            Hasher::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    fn finalize(self) -> String {
        match self {
            Hasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            Hasher::Sha256(hasher) => format!("{:x}", sha2::Digest::finalize(hasher)),
            Hasher::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
        }
    }
}

/// Digest an in-memory buffer.
pub fn compute_bytes_checksum(data: &[u8], algorithm: ChecksumAlgorithm) -> ChecksumValue {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    ChecksumValue::new(algorithm, hasher.finalize())
}

/// Stream a file through the digest in 64 KB chunks.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, EngineError> {
    let read_error = |source| EngineError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(read_error)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).map_err(read_error)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(ChecksumValue::new(algorithm, hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_value() {
        let value = compute_bytes_checksum(b"hello", ChecksumAlgorithm::Md5);
        assert_eq!(value.hex(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_sha256_known_value() {
        let value = compute_bytes_checksum(b"hello", ChecksumAlgorithm::Sha256);
        assert_eq!(
            value.hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_blake3_matches_reference() {
        let value = compute_bytes_checksum(b"hello", ChecksumAlgorithm::Blake3);
        assert_eq!(value.hex(), blake3::hash(b"hello").to_hex().as_str());
    }

    #[test]
    fn test_file_checksum_matches_buffer_checksum() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).expect("Failed to write file");

        for algorithm in [
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Blake3,
        ] {
            let from_file = compute_file_checksum(&path, algorithm).expect("checksum");
            assert_eq!(from_file, compute_bytes_checksum(&data, algorithm));
            assert_eq!(from_file.algorithm(), algorithm);
        }
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let result = compute_file_checksum(Path::new("/nonexistent/file"), ChecksumAlgorithm::Md5);
        assert!(matches!(result, Err(EngineError::Read { .. })));
    }

    #[test]
    fn test_sidecar_comparison_ignores_whitespace_and_case() {
        let value = compute_bytes_checksum(b"hello", ChecksumAlgorithm::Md5);
        assert!(value.matches_sidecar("5D41402ABC4B2A76B9719D911017C592\n"));
        assert!(!value.matches_sidecar("00000000000000000000000000000000"));
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("MD5".parse::<ChecksumAlgorithm>(), Ok(ChecksumAlgorithm::Md5));
        assert_eq!("blake3".parse::<ChecksumAlgorithm>(), Ok(ChecksumAlgorithm::Blake3));
        assert!("crc32".parse::<ChecksumAlgorithm>().is_err());
    }
}
