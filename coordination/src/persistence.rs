//! Durable record stores used by the breaker, stats and cache.
//!
//! A store persists a whole collection at once: `load_all` at startup,
//! `save_all` after every mutation. Callers treat failures as non-fatal
//! and keep their in-memory state authoritative.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Error type for record store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported store version {found} (expected <= {expected})")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for record store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a record store
pub type SharedStore<T> = Arc<dyn RecordStore<T>>;

/// A durable key-value store that loads and saves a full record set.
#[async_trait]
pub trait RecordStore<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Load every persisted record. A store that was never written returns
    /// an empty set.
    async fn load_all(&self) -> StoreResult<Vec<T>>;

    /// Replace the persisted set with `records`.
    async fn save_all(&self, records: &[T]) -> StoreResult<()>;
}

/// Current on-disk schema version.
const STORE_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    records: &'a [T],
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u32,
    records: Vec<T>,
}

/// JSON file store.
///
/// Writes go to a sibling temp file which is fsynced and renamed over the
/// target, so a crash mid-write leaves the previous file intact.
#[derive(Debug)]
pub struct JsonFileStore<T> {
    path: PathBuf,
    _records: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _records: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Directory holding the store file.
    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Flush the directory so the entry created by the rename survives a
    /// crash.
    #[cfg(unix)]
    async fn sync_dir(&self) -> StoreResult<()> {
        let dir = tokio::fs::File::open(self.dir())
            .await
            .map_err(|e| self.io_err(e))?;
        dir.sync_all().await.map_err(|e| self.io_err(e))
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) -> StoreResult<()> {
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl<T> RecordStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load_all(&self) -> StoreResult<Vec<T>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        let envelope: Envelope<T> =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
                path: self.path.clone(),
                source,
            })?;

        if envelope.version > STORE_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_VERSION,
                found: envelope.version,
            });
        }

        Ok(envelope.records)
    }

    async fn save_all(&self, records: &[T]) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(&EnvelopeRef {
            version: STORE_VERSION,
            records,
        })
        .map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        tokio::fs::create_dir_all(self.dir())
            .await
            .map_err(|e| self.io_err(e))?;

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(&bytes).await.map_err(|e| self.io_err(e))?;
        file.sync_all().await.map_err(|e| self.io_err(e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        self.sync_dir().await
    }
}

/// In-memory store for tests and ephemeral engines.
///
/// Can be switched into a failing mode to exercise persistence error paths.
#[derive(Debug)]
pub struct MemoryStore<T> {
    records: Mutex<Vec<T>>,
    failing: AtomicBool,
    saves: AtomicUsize,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
        }
    }
}

impl<T: Clone> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the store, as if a previous process had saved `records`.
    pub fn with_records(records: Vec<T>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    /// Make every subsequent load/save fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The last saved record set.
    pub fn records(&self) -> Vec<T> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl<T> RecordStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn load_all(&self) -> StoreResult<Vec<T>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        Ok(self.records())
    }

    async fn save_all(&self, records: &[T]) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        *self.records.lock().unwrap_or_else(|e| e.into_inner()) = records.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
