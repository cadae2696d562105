//! Content Hasher - BLAKE3 digests of canonical encodings
//!
//! - 256-bit output, never truncated in keys
//! - Pure functions, safe to call from any thread
//! - Lowercase hex rendering for storage keys and file names

use crate::descriptor::TaskDescriptor;
use crate::encoder::{self, EncodingError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A node's content identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; ContentHash::LEN]);

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid content hash `{0}`: expected 64 hex characters")]
pub struct ParseHashError(String);

impl ContentHash {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Full 64-character lowercase hex
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Hex prefix for display ("salt" in file names). Not a key.
    pub fn short(&self, len: usize) -> String {
        let mut hex = self.to_hex();
        hex.truncate(len.min(Self::LEN * 2));
        hex
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short(12))
    }
}

impl FromStr for ContentHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        blake3::Hash::from_hex(s)
            .map(|hash| Self(*hash.as_bytes()))
            .map_err(|_| ParseHashError(s.to_string()))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash arbitrary bytes with BLAKE3
pub fn digest(bytes: &[u8]) -> ContentHash {
    ContentHash(*blake3::hash(bytes).as_bytes())
}

/// Encode and hash one node given its dependencies' resolved hashes
pub fn hash_node(
    descriptor: &TaskDescriptor,
    dependency_hashes: &[ContentHash],
) -> Result<ContentHash, EncodingError> {
    let encoded = encoder::encode(descriptor, dependency_hashes)?;
    Ok(digest(&encoded))
}
