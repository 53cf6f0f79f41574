//! Checksum computation and verification.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

/// Read buffer size for streaming digests.
const CHUNK_SIZE: usize = 64 * 1024;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Lowercase algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of the hex digest.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(Error::spec(format!("unsupported checksum algorithm '{other}'"))),
        }
    }
}

/// Compute the hex digest of a stream.
pub fn compute<R: Read>(reader: R, algorithm: ChecksumAlgorithm) -> std::io::Result<String> {
    match algorithm {
        ChecksumAlgorithm::Md5 => digest_reader::<Md5, _>(reader),
        ChecksumAlgorithm::Sha1 => digest_reader::<Sha1, _>(reader),
        ChecksumAlgorithm::Sha256 => digest_reader::<Sha256, _>(reader),
        ChecksumAlgorithm::Sha384 => digest_reader::<Sha384, _>(reader),
        ChecksumAlgorithm::Sha512 => digest_reader::<Sha512, _>(reader),
    }
}

/// Compute the hex digest of in-memory bytes.
pub fn compute_bytes(bytes: &[u8], algorithm: ChecksumAlgorithm) -> String {
    // Reading from a slice cannot fail
    compute(bytes, algorithm).unwrap_or_default()
}

/// Compute the hex digest of a file.
pub fn compute_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    compute(BufReader::new(file), algorithm).map_err(|e| Error::io(path, e))
}

fn digest_reader<D: Digest, R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare two hex digests in constant time, ignoring ASCII case.
pub fn verify(actual: &str, expected: &str) -> bool {
    let a = actual.trim().as_bytes();
    let b = expected.trim().as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b)
        .fold(0u8, |acc, (x, y)| acc | (x.to_ascii_lowercase() ^ y.to_ascii_lowercase()))
        == 0
}

/// Verify a file against an expected digest.
pub fn verify_file(path: &Path, expected: &str, algorithm: ChecksumAlgorithm) -> Result<String> {
    let actual = compute_file(path, algorithm)?;
    if verify(&actual, expected) {
        Ok(actual)
    } else {
        Err(Error::ChecksumMismatch {
            path: path.to_path_buf(),
            algorithm,
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        let data = b"abc";
        assert_eq!(
            compute_bytes(data, ChecksumAlgorithm::Md5),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            compute_bytes(data, ChecksumAlgorithm::Sha1),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            compute_bytes(data, ChecksumAlgorithm::Sha256),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hex_lengths_match() {
        for algorithm in [
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Sha1,
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Sha384,
            ChecksumAlgorithm::Sha512,
        ] {
            assert_eq!(compute_bytes(b"x", algorithm).len(), algorithm.hex_len());
        }
    }

    #[test]
    fn test_verify_ignores_case_and_whitespace() {
        assert!(verify("abcdef", "ABCDEF"));
        assert!(verify("abcdef", " abcdef\n"));
        assert!(!verify("abcdef", "abcdee"));
        assert!(!verify("abcdef", "abcde"));
    }

    #[test]
    fn test_verify_file_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootfs.tar");
        std::fs::write(&path, b"rootfs").unwrap();

        let err = verify_file(&path, "deadbeef", ChecksumAlgorithm::Sha1).unwrap_err();
        match err {
            Error::ChecksumMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, "deadbeef");
                assert_eq!(actual.len(), 40);
            }
            other => panic!("unexpected error: {other}"),
        }

        let good = compute_bytes(b"rootfs", ChecksumAlgorithm::Sha1);
        assert_eq!(verify_file(&path, &good, ChecksumAlgorithm::Sha1).unwrap(), good);
    }

    #[test]
    fn test_algorithm_parse_and_default() {
        assert_eq!(ChecksumAlgorithm::default(), ChecksumAlgorithm::Sha256);
        assert_eq!("SHA512".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Sha512);
        assert!("crc32".parse::<ChecksumAlgorithm>().is_err());
    }
}
