//! Stage 1: fetch and order every creator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, Cacheable};
use crate::error::StageError;
use crate::model::Creator;
use crate::pipeline::context::{StageContext, MISSING_STORE};
use crate::pipeline::ordering::EntityOrderer;
use crate::pipeline::stage::{Stage, StageId};

/// The ordered creator list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutput {
    pub creators: Vec<Creator>,
    pub fetched_at: DateTime<Utc>,
}

impl Cacheable for FetchOutput {
    fn success_count(&self) -> usize {
        self.creators.len()
    }
}

/// Reads the whole creator table once per batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchStage;

#[async_trait]
impl Stage for FetchStage {
    type Input = ();
    type Output = FetchOutput;

    fn id(&self) -> StageId {
        StageId::Fetch
    }

    fn cache_key(&self, _input: &()) -> CacheKey {
        CacheKey::all_creators()
    }

    fn validate(&self, ctx: &StageContext, _input: &()) -> Result<(), String> {
        if ctx.store.is_none() {
            return Err(MISSING_STORE.to_string());
        }
        Ok(())
    }

    async fn execute(&self, ctx: &StageContext, input: &()) -> Result<FetchOutput, StageError> {
        self.ensure_valid(ctx, input)?;
        let store = ctx.store(self.id())?;

        let creators = store.fetch_creators().await?;
        let unkeyed = creators.iter().filter(|c| c.key().is_none()).count();
        if unkeyed > 0 {
            tracing::warn!(count = unkeyed, "Creators without creator_id or id will be skipped");
        }

        let creators = EntityOrderer::order(creators);
        tracing::info!(count = creators.len(), "Fetched creators");

        Ok(FetchOutput {
            creators,
            fetched_at: Utc::now(),
        })
    }
}
