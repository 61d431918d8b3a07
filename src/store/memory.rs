//! In-memory [`EntityStore`] used by tests and local dry runs.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::EntityStore;
use crate::error::StoreError;
use crate::model::{Creator, MagnetKey, MagnetRecord, OutreachUpdate, Status};

#[derive(Debug, Default)]
struct Tables {
    creators: Vec<Creator>,
    magnets: Vec<MagnetRecord>,
    outreach: HashMap<String, OutreachUpdate>,
    status_history: Vec<(String, Status)>,
    inserts: usize,
    updates: usize,
}

/// A store holding both tables in process memory.
///
/// Failure switches let tests exercise the error paths of the callers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_fetch: AtomicBool,
    fail_status_writes: AtomicBool,
    race_next_insert: AtomicBool,
    failing_contexts: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_creators(creators: Vec<Creator>) -> Self {
        let store = Self::new();
        store.lock().creators = creators;
        store
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes `fetch_creators` fail with a server error.
    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Makes every status write fail with a server error.
    pub fn fail_status_writes(&self, fail: bool) {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes writes of magnets with this `context_id` fail with a server error.
    pub fn fail_magnet_writes_for(&self, context_id: impl Into<String>) {
        self.failing_contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(context_id.into());
    }

    /// The next insert behaves as if a concurrent writer inserted the same
    /// key first: the row is stored and the call returns a conflict.
    pub fn race_next_insert(&self) {
        self.race_next_insert.store(true, Ordering::SeqCst);
    }

    pub fn status_of(&self, creator_id: &str) -> Option<Status> {
        self.lock()
            .creators
            .iter()
            .find(|c| c.matches(creator_id))
            .map(|c| c.status())
    }

    /// Every status write, in order.
    pub fn status_history(&self) -> Vec<(String, Status)> {
        self.lock().status_history.clone()
    }

    pub fn magnets(&self) -> Vec<MagnetRecord> {
        self.lock().magnets.clone()
    }

    pub fn magnet(&self, key: &MagnetKey) -> Option<MagnetRecord> {
        self.lock().magnets.iter().find(|m| m.key() == *key).cloned()
    }

    pub fn outreach_for(&self, creator_id: &str) -> Option<OutreachUpdate> {
        self.lock().outreach.get(creator_id).cloned()
    }

    /// Number of (inserts, updates) performed on the magnet table.
    pub fn write_counts(&self) -> (usize, usize) {
        let tables = self.lock();
        (tables.inserts, tables.updates)
    }

    fn check_magnet_write(&self, context_id: &str) -> Result<(), StoreError> {
        let failing = self
            .failing_contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if failing.contains(context_id) {
            return Err(StoreError::Http {
                status: 500,
                body: format!("write rejected for {}", context_id),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn fetch_creators(&self) -> Result<Vec<Creator>, StoreError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(StoreError::Http {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(self.lock().creators.clone())
    }

    async fn creators_with_status(&self, status: Status) -> Result<Vec<Creator>, StoreError> {
        Ok(self
            .lock()
            .creators
            .iter()
            .filter(|c| c.status() == status)
            .cloned()
            .collect())
    }

    async fn set_creator_status(&self, creator_id: &str, status: Status) -> Result<(), StoreError> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Http {
                status: 500,
                body: "status write rejected".to_string(),
            });
        }

        let mut tables = self.lock();
        tables
            .status_history
            .push((creator_id.to_string(), status));
        for creator in tables.creators.iter_mut().filter(|c| c.matches(creator_id)) {
            creator.status = Some(status.as_str().to_string());
        }
        Ok(())
    }

    async fn update_outreach(
        &self,
        creator_id: &str,
        update: &OutreachUpdate,
    ) -> Result<(), StoreError> {
        self.lock()
            .outreach
            .insert(creator_id.to_string(), update.clone());
        Ok(())
    }

    async fn find_magnet(&self, key: &MagnetKey) -> Result<Option<MagnetRecord>, StoreError> {
        Ok(self.magnet(key))
    }

    async fn insert_magnet(&self, record: &MagnetRecord) -> Result<(), StoreError> {
        self.check_magnet_write(&record.context_id)?;

        let mut tables = self.lock();
        let key = record.key();
        let raced = self.race_next_insert.swap(false, Ordering::SeqCst);
        if raced || tables.magnets.iter().any(|m| m.key() == key) {
            if raced {
                tables.magnets.push(MagnetRecord::new(&key));
            }
            return Err(StoreError::Conflict {
                table: super::MAGNET_TABLE.to_string(),
                body: format!("duplicate key ({})", key),
            });
        }

        tables.inserts += 1;
        tables.magnets.push(record.clone());
        Ok(())
    }

    async fn update_magnet(
        &self,
        key: &MagnetKey,
        record: &MagnetRecord,
    ) -> Result<(), StoreError> {
        self.check_magnet_write(&key.context_id)?;

        let mut tables = self.lock();
        tables.updates += 1;
        for existing in tables.magnets.iter_mut().filter(|m| m.key() == *key) {
            existing.merge(record);
        }
        Ok(())
    }
}
