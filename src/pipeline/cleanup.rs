//! Resetting failed creators so the next run retries them.

use serde::{Deserialize, Serialize};

use crate::cache::CacheKey;
use crate::error::{PipelineError, StoreError};
use crate::model::Status;
use crate::store::StatusStore;

use super::context::StageContext;
use super::stage::StageId;

/// Stages whose records are dropped on reset. Fetch and prompt output is kept.
pub const RESET_STAGES: [StageId; 2] = [StageId::Render, StageId::Compose];

/// Outcome of [`reset_failed`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Creators found with status `failed`.
    pub found: usize,
    /// Creators moved back to `pending`.
    pub reset: Vec<String>,
    /// Creators left `failed` because a cache record could not be removed.
    pub cache_failures: Vec<String>,
    /// Creators whose cache was cleared but whose status write failed.
    pub status_failures: Vec<String>,
}

/// Clears the render and compose cache of every failed creator and marks it
/// pending again.
///
/// The status is only reset when every removal succeeded. A record that did
/// not exist counts as removed.
///
/// # Errors
///
/// Returns `PipelineError::Store` when no store is configured or the failed
/// creators cannot be listed.
pub async fn reset_failed(ctx: &StageContext) -> Result<CleanupReport, PipelineError> {
    let store = ctx
        .store
        .clone()
        .ok_or(PipelineError::Store(StoreError::MissingCredentials))?;
    let status = StatusStore::new(store.clone());

    let failed = store.creators_with_status(Status::Failed).await?;
    let mut report = CleanupReport {
        found: failed.len(),
        ..Default::default()
    };
    tracing::info!(count = failed.len(), "Found failed creators");

    for creator in failed {
        let Some(id) = creator.key() else {
            tracing::warn!("Failed creator has no creator_id or id, skipping");
            continue;
        };

        let mut removed_all = true;
        for stage in RESET_STAGES {
            if !ctx.cache.invalidate(&CacheKey::new(&id, stage)).await {
                removed_all = false;
            }
        }

        if !removed_all {
            tracing::warn!(creator_id = %id, "Cache not fully cleared, leaving status failed");
            report.cache_failures.push(id);
        } else if status.set_status(&id, Status::Pending).await {
            tracing::info!(creator_id = %id, "Reset creator to pending");
            report.reset.push(id);
        } else {
            report.status_failures.push(id);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryBackend, ResultCache};
    use crate::model::Creator;
    use crate::pipeline::PipelineConfig;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn creator(id: &str, status: &str) -> Creator {
        Creator {
            creator_id: Some(json!(id)),
            status: Some(status.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resets_failed_and_keeps_early_stages() {
        let store = Arc::new(MemoryStore::with_creators(vec![
            creator("bad", "failed"),
            creator("good", "completed"),
        ]));
        let backend = Arc::new(MemoryBackend::new());
        for stage in StageId::ALL {
            backend.insert_raw(CacheKey::new("bad", stage), b"{}".to_vec());
        }
        let ctx = StageContext::new(PipelineConfig::default())
            .with_cache(ResultCache::new(backend.clone()))
            .with_store(store.clone());

        let report = reset_failed(&ctx).await.unwrap();

        assert_eq!(report.found, 1);
        assert_eq!(report.reset, vec!["bad"]);
        assert_eq!(store.status_of("bad"), Some(Status::Pending));
        assert_eq!(store.status_of("good"), Some(Status::Completed));
        assert!(backend.contains(&CacheKey::new("bad", StageId::Fetch)));
        assert!(backend.contains(&CacheKey::new("bad", StageId::Prompt)));
        assert!(!backend.contains(&CacheKey::new("bad", StageId::Render)));
        assert!(!backend.contains(&CacheKey::new("bad", StageId::Compose)));
    }

    #[tokio::test]
    async fn test_status_failure_is_reported() {
        let store = Arc::new(MemoryStore::with_creators(vec![creator("bad", "failed")]));
        store.fail_status_writes(true);
        let ctx = StageContext::new(PipelineConfig::default())
            .with_cache(ResultCache::in_memory())
            .with_store(store);

        let report = reset_failed(&ctx).await.unwrap();
        assert!(report.reset.is_empty());
        assert_eq!(report.status_failures, vec!["bad"]);
    }

    #[tokio::test]
    async fn test_requires_store() {
        let ctx = StageContext::new(PipelineConfig::default()).with_cache(ResultCache::in_memory());
        assert!(matches!(
            reset_failed(&ctx).await,
            Err(PipelineError::Store(StoreError::MissingCredentials))
        ));
    }
}
