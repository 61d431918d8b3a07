//! Storage backends for the result cache.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::CacheKey;

/// Byte-level storage of cache records.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Reads a record; `Ok(None)` when it does not exist.
    async fn read(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>>;

    /// Writes a record, replacing any previous value.
    async fn write(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()>;

    /// Deletes a record; `Ok(false)` when it did not exist.
    async fn remove(&self, key: &CacheKey) -> io::Result<bool>;

    /// Lists every stored key.
    async fn keys(&self) -> io::Result<Vec<CacheKey>>;
}

/// One JSON file per record in a single directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn read(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        // Atomic replace through a temp file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    async fn remove(&self, key: &CacheKey) -> io::Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn keys(&self) -> io::Result<Vec<CacheKey>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(key) = entry.file_name().to_str().and_then(CacheKey::from_file_name) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// In-process backend for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw bytes, bypassing serialization.
    pub fn insert_raw(&self, key: CacheKey, bytes: Vec<u8>) {
        self.lock().insert(key, bytes);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Vec<u8>>> {
        // A poisoned map is still structurally valid.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn read(&self, key: &CacheKey) -> io::Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn write(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<()> {
        self.lock().insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> io::Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn keys(&self) -> io::Result<Vec<CacheKey>> {
        Ok(self.lock().keys().cloned().collect())
    }
}
