//! Snapshot persistence keyed by idempotency key.
//!
//! Two stores ship with the crate: an in-memory one for tests and single
//! process hosts, and a file-based one writing one JSON document per key.
//! Both give per-key atomic `get`/`set`.

use std::fs::OpenOptions as StdOpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::debug;

use crate::domain::Snapshot;

/// Persists and retrieves resumable checkpoints.
///
/// Implementations must make `get` and `set` atomic per key.
#[async_trait]
pub trait SnapshotStore<R, S>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Snapshot<R, S>>>;

    /// Store a snapshot, replacing any previous one for the key
    async fn set(&self, key: &str, snapshot: Snapshot<R, S>) -> Result<()>;
}

/// In-memory store holding serialized snapshots
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: DashMap<String, String>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop the snapshot for a key, returning whether one existed
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Raw JSON stored under a key
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.value().clone())
    }
}

#[async_trait]
impl<R, S> SnapshotStore<R, S> for MemorySnapshotStore
where
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Snapshot<R, S>>> {
        let Some(json) = self.raw(key) else {
            return Ok(None);
        };

        let snapshot = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse snapshot for key: {}", key))?;
        Ok(Some(snapshot))
    }

    async fn set(&self, key: &str, snapshot: Snapshot<R, S>) -> Result<()> {
        let json = serde_json::to_string(&snapshot).context("Failed to serialize snapshot")?;
        self.entries.insert(key.to_string(), json);
        Ok(())
    }
}

/// File-based store: `<dir>/<sha256(key)>.json`
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Create or open a store rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create snapshot directory: {}", dir.display()))?;

        Ok(Self { dir })
    }

    /// Open the store in the configured snapshot directory
    pub async fn from_config() -> Result<Self> {
        Self::open(crate::config::snapshots_dir()?).await
    }

    /// Directory holding the snapshot files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing a key
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key_digest(key)))
    }

    /// Read a snapshot as untyped JSON
    pub async fn read_raw(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;

        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;
        Ok(Some(value))
    }

    /// Delete the snapshot for a key and its lock file, returning whether
    /// a snapshot existed
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        let lock_path = path.with_extension("lock");

        let existed = path.exists();
        if existed {
            fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to remove snapshot: {}", path.display()))?;
        }

        if lock_path.exists() {
            fs::remove_file(&lock_path)
                .await
                .with_context(|| format!("Failed to remove lock file: {}", lock_path.display()))?;
        }

        Ok(existed)
    }
}

#[async_trait]
impl<R, S> SnapshotStore<R, S> for FileSnapshotStore
where
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Snapshot<R, S>>> {
        let path = self.path_for(key);

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;

        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;
        Ok(Some(snapshot))
    }

    async fn set(&self, key: &str, snapshot: Snapshot<R, S>) -> Result<()> {
        let json = serde_json::to_vec_pretty(&snapshot).context("Failed to serialize snapshot")?;
        let dir = self.dir.clone();
        let path = self.path_for(key);

        debug!(path = %path.display(), bytes = json.len(), "Writing snapshot");

        tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &json))
            .await
            .context("Snapshot writer task failed")?
    }
}

/// Replace `path` with `bytes` via a temp file in the same directory.
///
/// Writers of the same key are serialized by an exclusive lock on a
/// sibling `.lock` file; readers never see a partial document because the
/// final step is a rename.
fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let lock_path = path.with_extension("lock");
    let lock = StdOpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
    FileExt::lock_exclusive(&lock)
        .with_context(|| format!("Failed to lock: {}", lock_path.display()))?;

    let mut tmp = NamedTempFile::new_in(dir).context("Failed to create temp snapshot file")?;
    tmp.write_all(bytes).context("Failed to write snapshot")?;
    tmp.as_file().sync_all().context("Failed to flush snapshot")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to persist snapshot: {}", path.display()))?;

    FileExt::unlock(&lock).ok();
    Ok(())
}

/// Idempotency key for a request: SHA-256 of its JSON encoding, hex encoded.
///
/// The request goes through `serde_json::Value` first so map keys are
/// sorted and the digest does not depend on field or insertion order.
pub fn request_hash<R: Serialize>(request: &R) -> serde_json::Result<String> {
    let canonical = serde_json::to_vec(&serde_json::to_value(request)?)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// File-name-safe digest of an idempotency key
pub fn key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
