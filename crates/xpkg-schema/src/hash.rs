//! Content-hash specifications of the form `<algo>-<hex>`.
//!
//! Recipe `files` tables and the source cache key every fetched file by one
//! of these specs. The hex part may be empty, which means "hash unknown":
//! the cache downloads first, hashes, and fills the digest in.

use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use digest::DynDigest;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Read buffer for streaming digests.
const HASH_BLOCK_SIZE: usize = 1 << 20;

/// Error raised for malformed hash specs.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// The spec had no `-` separating algorithm and digest.
    #[error("hash spec '{0}' is missing the '<algo>-<hex>' separator")]
    MissingSeparator(String),

    /// The algorithm name is not one we support.
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    /// The digest part contains non-hex characters.
    #[error("hash spec '{0}' has a non-hex digest")]
    BadDigest(String),
}

/// The digest algorithms a recipe may key its sources with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgo {
    /// The lowercase name used in specs and cache file names.
    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    fn hasher(self) -> Box<dyn DynDigest> {
        match self {
            Self::Md5 => Box::new(md5::Md5::default()),
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha224 => Box::new(sha2::Sha224::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
            Self::Sha384 => Box::new(sha2::Sha384::default()),
            Self::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }

    /// Hex digest of everything `reader` yields.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the reader fails.
    pub fn hash_reader(self, mut reader: impl Read) -> io::Result<String> {
        let mut hasher = self.hasher();
        let mut buf = vec![0u8; HASH_BLOCK_SIZE];

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Hex digest of an in-memory byte string.
    pub fn hash_bytes(self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }
}

impl FromStr for HashAlgo {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(HashError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A parsed `<algo>-<hex>` spec.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashSpec {
    algo: HashAlgo,
    hex: String,
}

impl HashSpec {
    /// Build a spec from an algorithm and a (possibly empty) hex digest.
    ///
    /// # Errors
    ///
    /// Returns [`HashError::BadDigest`] if `hex` contains non-hex characters.
    pub fn new(algo: HashAlgo, hex: impl Into<String>) -> Result<Self, HashError> {
        let hex = hex.into();
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::BadDigest(format!("{algo}-{hex}")));
        }
        Ok(Self {
            algo,
            hex: hex.to_lowercase(),
        })
    }

    /// The algorithm half of the spec.
    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    /// The hex digest, empty when the recipe left it unresolved.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Whether the digest is present (a spec like `sha256-` has none).
    pub fn has_digest(&self) -> bool {
        !self.hex.is_empty()
    }

    /// A copy of this spec carrying `hex` as its digest.
    pub fn with_digest(&self, hex: impl Into<String>) -> Result<Self, HashError> {
        Self::new(self.algo, hex)
    }
}

impl FromStr for HashSpec {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex) = s
            .split_once('-')
            .ok_or_else(|| HashError::MissingSeparator(s.to_string()))?;

        Self::new(algo.parse()?, hex)
    }
}

impl fmt::Display for HashSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algo, self.hex)
    }
}

impl Serialize for HashSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HashSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let spec: HashSpec = "md5-9a8ad92c50cae39aa2c5604fd0ab6d8c".parse().unwrap();
        assert_eq!(spec.algo(), HashAlgo::Md5);
        assert_eq!(spec.to_string(), "md5-9a8ad92c50cae39aa2c5604fd0ab6d8c");
    }

    #[test]
    fn empty_digest_is_legal() {
        let spec: HashSpec = "sha256-".parse().unwrap();
        assert!(!spec.has_digest());
    }

    #[test]
    fn rejects_unknown_algo_and_bad_hex() {
        assert!("crc32-abcd".parse::<HashSpec>().is_err());
        assert!("sha1-zzzz".parse::<HashSpec>().is_err());
        assert!("sha256".parse::<HashSpec>().is_err());
    }

    #[test]
    fn digest_matches_known_vector() {
        // MD5 of the empty string.
        assert_eq!(
            HashAlgo::Md5.hash_bytes(b""),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        // SHA-256 of "abc".
        assert_eq!(
            HashAlgo::Sha256.hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn reader_and_bytes_agree() {
        let data = b"some package source".as_slice();
        assert_eq!(
            HashAlgo::Sha512.hash_reader(data).unwrap(),
            HashAlgo::Sha512.hash_bytes(data)
        );
    }
}
