//! Result cache: memoizes stage outputs per (creator, stage).
//!
//! Every record is a human-readable JSON document. The cache never surfaces
//! an error to its callers: a failed or corrupt read is a miss, and a failed
//! write is logged and reported as `false`.
//!
//! Storage is behind the [`CacheBackend`] trait so tests can run against
//! [`MemoryBackend`] instead of the filesystem.

mod backend;

pub use backend::{CacheBackend, FileBackend, MemoryBackend};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::pipeline::StageId;

/// Identifier used for the batch-wide fetch record.
pub const ALL_CREATORS: &str = "all_creators";

/// A stage output that may be memoized.
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Number of successfully produced sub-items. Outputs with zero are never cached.
    fn success_count(&self) -> usize;
}

/// Key of one cache record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub entity_id: String,
    pub stage: StageId,
}

impl CacheKey {
    pub fn new(entity_id: impl Into<String>, stage: StageId) -> Self {
        Self {
            entity_id: entity_id.into(),
            stage,
        }
    }

    /// The single shared record of the batch-wide fetch.
    pub fn all_creators() -> Self {
        Self::new(ALL_CREATORS, StageId::Fetch)
    }

    /// File name of this record, unique per stage.
    pub fn file_name(&self) -> String {
        format!("creator_{}_{}.json", sanitize(&self.entity_id), self.stage)
    }

    /// Inverse of [`CacheKey::file_name`] for sanitized identifiers.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let body = name.strip_prefix("creator_")?.strip_suffix(".json")?;
        StageId::ALL.into_iter().find_map(|stage| {
            body.strip_suffix(stage.as_str())
                .and_then(|rest| rest.strip_suffix('_'))
                .filter(|id| !id.is_empty())
                .map(|id| Self::new(id, stage))
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_id, self.stage)
    }
}

/// Replaces every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize(entity_id: &str) -> String {
    entity_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Memoization of stage outputs.
#[derive(Clone)]
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Cache stored as JSON files under `dir`.
    pub fn on_disk(dir: impl Into<std::path::PathBuf>) -> Self {
        Self::new(Arc::new(FileBackend::new(dir)))
    }

    /// Cache held in process memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Loads a record. Missing, unreadable and corrupt records all return `None`;
    /// corrupt records are deleted.
    pub async fn load<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let bytes = match self.backend.read(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to read cache record");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding corrupt cache record");
                if let Err(e) = self.backend.remove(key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to delete corrupt cache record");
                }
                None
            }
        }
    }

    /// Loads a record as untyped JSON, for inspection.
    pub async fn load_raw(&self, key: &CacheKey) -> Option<serde_json::Value> {
        self.load(key).await
    }

    /// Persists a record. Returns `false` without writing when the output
    /// holds no successful sub-items, or when the write fails.
    pub async fn save<T: Cacheable>(&self, key: &CacheKey, value: &T) -> bool {
        if value.success_count() == 0 {
            tracing::debug!(key = %key, "Not caching stage output with no successful items");
            return false;
        }

        let bytes = match serde_json::to_vec_pretty(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to serialize cache record");
                return false;
            }
        };

        match self.backend.write(key, &bytes).await {
            Ok(()) => {
                tracing::debug!(key = %key, bytes = bytes.len(), "Saved cache record");
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to write cache record");
                false
            }
        }
    }

    /// Removes a record. A record that does not exist counts as removed;
    /// only an I/O failure returns `false`.
    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        match self.backend.remove(key).await {
            Ok(existed) => {
                if existed {
                    tracing::debug!(key = %key, "Removed cache record");
                }
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to remove cache record");
                false
            }
        }
    }

    /// Lists stored keys, optionally restricted to one creator and/or stage.
    pub async fn keys(&self, entity_id: Option<&str>, stage: Option<StageId>) -> Vec<CacheKey> {
        let mut keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list cache records");
                return Vec::new();
            }
        };

        let wanted = entity_id.map(sanitize);
        keys.retain(|key| {
            wanted
                .as_deref()
                .map_or(true, |id| sanitize(&key.entity_id) == id)
                && stage.map_or(true, |s| key.stage == s)
        });
        keys.sort();
        keys
    }

    /// Removes matching records and returns how many were deleted.
    pub async fn clear(&self, entity_id: Option<&str>, stage: Option<StageId>) -> usize {
        let mut removed = 0;
        for key in self.keys(entity_id, stage).await {
            match self.backend.remove(&key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to remove cache record"),
            }
        }
        tracing::info!(removed, "Cleared cache records");
        removed
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache").finish_non_exhaustive()
    }
}
