//! Stage identity and the contract every pipeline stage implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::{CacheKey, Cacheable};
use crate::error::StageError;

use super::context::StageContext;

/// The four ordered processing steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageId {
    #[serde(rename = "step_one")]
    Fetch,
    #[serde(rename = "step_two")]
    Prompt,
    #[serde(rename = "step_three")]
    Render,
    #[serde(rename = "step_four")]
    Compose,
}

impl StageId {
    pub const ALL: [StageId; 4] = [
        StageId::Fetch,
        StageId::Prompt,
        StageId::Render,
        StageId::Compose,
    ];

    /// 1-based position in the pipeline.
    pub fn number(&self) -> u8 {
        match self {
            StageId::Fetch => 1,
            StageId::Prompt => 2,
            StageId::Render => 3,
            StageId::Compose => 4,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.number() == n)
    }

    /// Name used in cache file names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Fetch => "step_one",
            StageId::Prompt => "step_two",
            StageId::Render => "step_three",
            StageId::Compose => "step_four",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageId::Fetch => "fetch",
            StageId::Prompt => "prompt",
            StageId::Render => "render",
            StageId::Compose => "compose",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageId {
    type Err = String;

    /// Accepts `3`, `step_three` or `render`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if let Ok(n) = s.parse::<u8>() {
            return Self::from_number(n).ok_or_else(|| format!("no stage numbered {}", n));
        }
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s || stage.label() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Outcome of running a stage through the cache.
#[derive(Debug, Clone)]
pub struct StageRun<T> {
    pub output: T,
    pub from_cache: bool,
}

/// One processing step of the pipeline.
///
/// `execute` validates its preconditions first and performs remote writes
/// only after validation passes. `run` wraps `execute` with the result cache.
#[async_trait]
pub trait Stage: Send + Sync {
    /// What the stage consumes: `()` for the batch-wide fetch, the creator's
    /// accumulated state for the per-creator stages.
    type Input: Send + Sync;
    type Output: Cacheable;

    fn id(&self) -> StageId;

    fn cache_key(&self, input: &Self::Input) -> CacheKey;

    /// Checks preconditions. `Err` carries a human-readable reason.
    fn validate(&self, ctx: &StageContext, input: &Self::Input) -> Result<(), String>;

    async fn execute(
        &self,
        ctx: &StageContext,
        input: &Self::Input,
    ) -> Result<Self::Output, StageError>;

    /// Fails fast with a `Validation` error when `validate` rejects the input.
    fn ensure_valid(&self, ctx: &StageContext, input: &Self::Input) -> Result<(), StageError> {
        self.validate(ctx, input)
            .map_err(|reason| StageError::validation(self.id(), reason))
    }

    /// Returns the cached output when caching is enabled and a record exists,
    /// otherwise executes and caches the result.
    async fn run(
        &self,
        ctx: &StageContext,
        input: &Self::Input,
    ) -> Result<StageRun<Self::Output>, StageError> {
        let key = self.cache_key(input);

        if ctx.config.use_cache {
            if let Some(output) = ctx.cache.load::<Self::Output>(&key).await {
                tracing::info!(stage = %self.id(), key = %key, "Using cached stage result");
                return Ok(StageRun {
                    output,
                    from_cache: true,
                });
            }
        }

        let output = self.execute(ctx, input).await?;

        if ctx.config.use_cache {
            ctx.cache.save(&key, &output).await;
        }

        Ok(StageRun {
            output,
            from_cache: false,
        })
    }
}
