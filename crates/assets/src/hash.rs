//! Content hashes for downloaded assets.
//!
//! The algorithm is inferred from the length of the hex digest, so a bare
//! string from a manifest or an ETag header is enough to build a [`Hash`].

use crate::error::{Error, Result};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha1,
    Md5,
}

impl HashAlgorithm {
    /// Length of the hex-encoded digest.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha1 => 40,
            Self::Md5 => 32,
        }
    }

    fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            64 => Some(Self::Sha256),
            40 => Some(Self::Sha1),
            32 => Some(Self::Md5),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha1 => write!(f, "sha1"),
            Self::Md5 => write!(f, "md5"),
        }
    }
}

/// A hex digest tagged with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algorithm: HashAlgorithm,
    hex: String,
}

impl Hash {
    /// Parse a hex digest, choosing the algorithm by its length.
    pub fn parse(s: &str) -> Result<Self> {
        let hex = s.trim().to_ascii_lowercase();
        let algorithm = HashAlgorithm::from_hex_len(hex.len())
            .ok_or_else(|| Error::InvalidHash(s.to_string()))?;
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidHash(s.to_string()));
        }
        Ok(Self { algorithm, hex })
    }

    /// Hex digest.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Hash everything a reader yields.
    pub fn of_reader(algorithm: HashAlgorithm, reader: &mut dyn Read) -> std::io::Result<Self> {
        let hex = match algorithm {
            HashAlgorithm::Sha256 => digest_reader::<Sha256>(reader)?,
            HashAlgorithm::Sha1 => digest_reader::<Sha1>(reader)?,
            HashAlgorithm::Md5 => digest_reader::<Md5>(reader)?,
        };
        Ok(Self { algorithm, hex })
    }

    /// Hash a byte slice.
    pub fn of_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let hex = match algorithm {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            HashAlgorithm::Sha1 => hex::encode(Sha1::digest(data)),
            HashAlgorithm::Md5 => hex::encode(Md5::digest(data)),
        };
        Self { algorithm, hex }
    }

    /// Hash a file on disk.
    pub fn of_file(algorithm: HashAlgorithm, path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
        Self::of_reader(algorithm, &mut file).map_err(|e| Error::io(path, e))
    }

    /// Check that a file on disk has this hash.
    pub fn verify_file(&self, path: &Path) -> Result<()> {
        let actual = Self::of_file(self.algorithm, path)?;
        if actual == *self {
            Ok(())
        } else {
            Err(Error::HashMismatch {
                path: path.to_path_buf(),
                expected: self.hex.clone(),
                actual: actual.hex,
            })
        }
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

fn digest_reader<D: Digest>(reader: &mut dyn Read) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_picks_algorithm_by_length() {
        let sha256 = Hash::parse(&"a".repeat(64)).unwrap();
        assert_eq!(sha256.algorithm, HashAlgorithm::Sha256);
        let sha1 = Hash::parse(&"b".repeat(40)).unwrap();
        assert_eq!(sha1.algorithm, HashAlgorithm::Sha1);
        let md5 = Hash::parse(&"C".repeat(32)).unwrap();
        assert_eq!(md5.algorithm, HashAlgorithm::Md5);
        assert_eq!(md5.hex(), "c".repeat(32));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Hash::parse("abc").is_err());
        assert!(Hash::parse(&"z".repeat(64)).is_err());
    }

    #[test]
    fn test_sha256_of_known_bytes() {
        let hash = Hash::of_bytes(HashAlgorithm::Sha256, b"hello");
        assert_eq!(
            hash.hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        let streamed = Hash::of_reader(HashAlgorithm::Sha256, &mut &b"hello"[..]).unwrap();
        assert_eq!(hash, streamed);
    }

    #[test]
    fn test_verify_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let good = Hash::of_bytes(HashAlgorithm::Md5, b"hello");
        assert!(good.verify_file(&path).is_ok());
        let bad = Hash::of_bytes(HashAlgorithm::Md5, b"other");
        assert!(matches!(
            bad.verify_file(&path),
            Err(Error::HashMismatch { .. })
        ));
    }
}
