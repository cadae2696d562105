//! Artifact Store boundary - where payloads live, keyed by lineage
//!
//! The engine only asks three things of a store: does `(task_id, hash)`
//! exist, read it, commit it. Commits must be atomic: a half-written
//! artifact must never report as existing.
//!
//! Implementations:
//! - `MemoryStore`: in-process map
//! - `FsStore`: `<root>/<task_id>/<hex>` files, temp file + rename
//! - `SledStore`: persistent sled tree

use crate::config::RetryPolicy;
use crate::hasher::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Compound artifact key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub task_id: String,
    pub content_hash: ContentHash,
}

impl ArtifactKey {
    pub fn new(task_id: impl Into<String>, content_hash: ContentHash) -> Self {
        Self {
            task_id: task_id.into(),
            content_hash,
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.task_id, self.content_hash)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact {0} not found")]
    NotFound(ArtifactKey),

    #[error("task id `{0}` cannot be used as a storage key")]
    InvalidKey(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store database error: {0}")]
    Db(#[from] sled::Error),

    #[error("store error: {0}")]
    Other(String),
}

/// External artifact persistence
pub trait ArtifactStore: Send + Sync {
    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError>;

    fn read(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError>;

    /// Atomically persist `payload` under `key`
    fn commit(&self, key: &ArtifactKey, payload: &[u8]) -> Result<(), StoreError>;
}

/// Run a store call under a retry policy (blocking sleeps between attempts)
pub fn with_retry<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            // Retrying cannot fix these
            Err(e @ (StoreError::NotFound(_) | StoreError::InvalidKey(_))) => return Err(e),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    artifacts: RwLock<HashMap<ArtifactKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything stored for one task id
    pub fn evict(&self, task_id: &str) -> usize {
        match self.artifacts.write() {
            Ok(mut artifacts) => {
                let before = artifacts.len();
                artifacts.retain(|key, _| key.task_id != task_id);
                before - artifacts.len()
            }
            Err(_) => 0,
        }
    }

    fn poisoned() -> StoreError {
        StoreError::Other("memory store lock poisoned".into())
    }
}

impl ArtifactStore for MemoryStore {
    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        let artifacts = self.artifacts.read().map_err(|_| Self::poisoned())?;
        Ok(artifacts.contains_key(key))
    }

    fn read(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        let artifacts = self.artifacts.read().map_err(|_| Self::poisoned())?;
        artifacts
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn commit(&self, key: &ArtifactKey, payload: &[u8]) -> Result<(), StoreError> {
        let mut artifacts = self.artifacts.write().map_err(|_| Self::poisoned())?;
        artifacts.insert(key.clone(), payload.to_vec());
        Ok(())
    }
}

/// Directory-per-task file store
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Final location of an artifact
    pub fn path_for(&self, key: &ArtifactKey) -> Result<PathBuf, StoreError> {
        let id = key.task_id.as_str();
        let single_component = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(&['/', '\\', '\0'][..]);
        if !single_component {
            return Err(StoreError::InvalidKey(key.task_id.clone()));
        }
        Ok(self.root.join(id).join(key.content_hash.to_hex()))
    }
}

impl ArtifactStore for FsStore {
    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        match fs::metadata(self.path_for(key)?) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(key.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, key: &ArtifactKey, payload: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        // Temp names never match a 64-char hex name, so `exists` ignores them
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(payload)?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

/// Persistent sled-backed store
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn db_key(key: &ArtifactKey) -> Vec<u8> {
        let mut k = Vec::with_capacity(key.task_id.len() + 1 + ContentHash::LEN);
        k.extend_from_slice(key.task_id.as_bytes());
        k.push(0);
        k.extend_from_slice(key.content_hash.as_bytes());
        k
    }

    /// (artifact count, size on disk)
    pub fn stats(&self) -> Result<(usize, u64), StoreError> {
        Ok((self.db.len(), self.db.size_on_disk()?))
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }
}

impl ArtifactStore for SledStore {
    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        Ok(self.db.contains_key(Self::db_key(key))?)
    }

    fn read(&self, key: &ArtifactKey) -> Result<Vec<u8>, StoreError> {
        match self.db.get(Self::db_key(key))? {
            Some(data) => Ok(data.to_vec()),
            None => Err(StoreError::NotFound(key.clone())),
        }
    }

    fn commit(&self, key: &ArtifactKey, payload: &[u8]) -> Result<(), StoreError> {
        if key.task_id.contains('\0') {
            return Err(StoreError::InvalidKey(key.task_id.clone()));
        }
        self.db.insert(Self::db_key(key), payload)?;
        self.db.flush()?;
        Ok(())
    }
}
