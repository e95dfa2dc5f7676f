// src/hash.rs

//! Content fingerprints
//!
//! A fingerprint summarizes everything about a content action that affects
//! what ends up on disk: its type, attributes and payload digest. Two actions
//! with equal fingerprints are interchangeable, which is what lets an
//! ownership move between packages collapse into a bookkeeping-only transfer.
//!
//! | Algorithm | Use |
//! |-----------|-----|
//! | SHA-256 | default; matches payload digests published by repositories |
//! | XXH128 | fast local comparison when cryptographic strength is not needed |

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_128;

/// Hash algorithm selection
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Xxh128,
}

impl HashAlgorithm {
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxh128 => "xxh128",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "xxh128" | "xxhash" | "xxh3" => Ok(Self::Xxh128),
            _ => Err(format!("unknown hash algorithm: {}", s)),
        }
    }
}

/// A digest tagged with its algorithm, written `algo:hex`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint {
    algorithm: HashAlgorithm,
    value: String,
}

impl Fingerprint {
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn as_hex(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (algo, value) = s
            .split_once(':')
            .ok_or_else(|| format!("fingerprint '{}' lacks an algorithm prefix", s))?;
        let algorithm = HashAlgorithm::from_str(algo)?;
        if hex::decode(value).is_err() {
            return Err(format!("invalid hex in fingerprint: {}", value));
        }
        Ok(Self {
            algorithm,
            value: value.to_lowercase(),
        })
    }
}

impl From<Fingerprint> for String {
    fn from(f: Fingerprint) -> Self {
        f.to_string()
    }
}

/// Incremental fingerprint builder
///
/// Fields are length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    // xxh3 one-shot API; buffer the input
    Xxh128(Vec<u8>),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Xxh128 => HasherState::Xxh128(Vec::new()),
        };
        Self { algorithm, state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Xxh128(buffer) => buffer.extend_from_slice(data),
        }
    }

    /// Feed one named field
    pub fn field(&mut self, name: &str, value: &str) {
        for part in [name, value] {
            self.update(&(part.len() as u64).to_le_bytes());
            self.update(part.as_bytes());
        }
    }

    pub fn finalize(self) -> Fingerprint {
        let value = match self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Xxh128(buffer) => hex::encode(xxh3_128(&buffer).to_be_bytes()),
        };
        Fingerprint {
            algorithm: self.algorithm,
            value,
        }
    }
}

/// Fingerprint a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Fingerprint {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Fingerprint a file's contents without reading it whole
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> io::Result<Fingerprint> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// The digest a manifest publishes for a file
///
/// `algo:hex` names its algorithm; bare 64-digit hex is SHA-256. Anything
/// else is not a digest the engine can check.
pub fn published_digest(hash: &str) -> Option<Fingerprint> {
    if let Ok(fingerprint) = Fingerprint::try_from(hash.to_string()) {
        return Some(fingerprint);
    }
    (hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()))
        .then(|| Fingerprint::try_from(format!("sha256:{}", hash)).ok())
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        let fp = hash_bytes(HashAlgorithm::Sha256, b"hello world");
        assert_eq!(
            fp.as_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert!(fp.to_string().starts_with("sha256:"));
    }

    #[test]
    fn test_xxh128_length() {
        let fp = hash_bytes(HashAlgorithm::Xxh128, b"hello world");
        assert_eq!(fp.as_hex().len(), 32);
    }

    #[test]
    fn test_fields_are_delimited() {
        let mut a = Hasher::new(HashAlgorithm::Sha256);
        a.field("ab", "c");
        let mut b = Hasher::new(HashAlgorithm::Sha256);
        b.field("a", "bc");
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_parse_prefixed() {
        let fp = hash_bytes(HashAlgorithm::Xxh128, b"x");
        let back = Fingerprint::try_from(fp.to_string()).unwrap();
        assert_eq!(back, fp);
        assert!(Fingerprint::try_from("abc".to_string()).is_err());
        assert!(Fingerprint::try_from("md5:00".to_string()).is_err());
        assert!(Fingerprint::try_from("sha256:zz".to_string()).is_err());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!(
            "SHA-256".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha256
        );
        assert_eq!("xxh3".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Xxh128);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("motd");
        std::fs::write(&path, b"hello world").unwrap();
        for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Xxh128] {
            assert_eq!(
                hash_file(algorithm, &path).unwrap(),
                hash_bytes(algorithm, b"hello world")
            );
        }
    }

    #[test]
    fn test_published_digest_forms() {
        let sha = hash_bytes(HashAlgorithm::Sha256, b"x");
        assert_eq!(published_digest(sha.as_hex()), Some(sha.clone()));
        assert_eq!(published_digest(&sha.to_string()), Some(sha));
        let xxh = hash_bytes(HashAlgorithm::Xxh128, b"x");
        assert_eq!(published_digest(&xxh.to_string()), Some(xxh));
        assert_eq!(published_digest("one"), None);
    }
}
