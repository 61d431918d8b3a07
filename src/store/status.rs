//! Best-effort creator status field.

use std::sync::Arc;

use super::EntityStore;
use crate::model::Status;

/// Writes the creator status column.
///
/// Status is observability, not durability: a failed write is logged and
/// reported as `false`, never as an error. Writes are last-writer-wins.
#[derive(Clone)]
pub struct StatusStore {
    store: Arc<dyn EntityStore>,
}

impl StatusStore {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub async fn set_status(&self, creator_id: &str, status: Status) -> bool {
        match self.store.set_creator_status(creator_id, status).await {
            Ok(()) => {
                tracing::debug!(creator_id, status = %status, "Updated creator status");
                true
            }
            Err(e) => {
                tracing::warn!(
                    creator_id,
                    status = %status,
                    error = %e,
                    "Failed to update creator status"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusStore").finish_non_exhaustive()
    }
}
