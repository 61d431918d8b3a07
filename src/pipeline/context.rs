//! Shared services and per-creator state handed to every stage.

use std::sync::Arc;

use crate::cache::ResultCache;
use crate::error::StageError;
use crate::generation::{DifyClient, ImageService, MediaClient, PromptService};
use crate::model::Creator;
use crate::scheduler::WorkerPool;
use crate::store::{EntityStore, SupabaseClient};

use super::config::PipelineConfig;
use super::stage::StageId;
use super::stages::{PromptOutput, RenderOutput};

/// Configuration plus the external collaborators a stage may call.
///
/// Services are optional: a context without a store or a prompt service is
/// still valid, and the stages that need the missing service fail their
/// validation instead.
#[derive(Clone)]
pub struct StageContext {
    pub config: Arc<PipelineConfig>,
    pub cache: ResultCache,
    pub store: Option<Arc<dyn EntityStore>>,
    pub prompts: Option<Arc<dyn PromptService>>,
    pub images: Option<Arc<dyn ImageService>>,
    /// Pool for intra-stage fan-out (one job per magnet).
    pub calls: WorkerPool,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("cache_dir", &self.config.cache_dir)
            .field("store", &self.store.is_some())
            .field("prompts", &self.prompts.is_some())
            .field("images", &self.images.is_some())
            .field("calls", &self.calls.size())
            .finish()
    }
}

impl StageContext {
    /// A context with no services, caching to `config.cache_dir`.
    pub fn new(config: PipelineConfig) -> Self {
        let cache = ResultCache::on_disk(config.cache_dir.clone());
        let calls = WorkerPool::new("calls", config.max_concurrent_calls);
        Self {
            config: Arc::new(config),
            cache,
            store: None,
            prompts: None,
            images: None,
            calls,
        }
    }

    /// Builds the production HTTP clients from `config`.
    ///
    /// A client whose settings are missing is left out and logged; the
    /// stages that need it report the gap when they validate.
    pub fn from_config(config: PipelineConfig) -> Self {
        let store = match SupabaseClient::from_config(&config) {
            Ok(client) => Some(Arc::new(client) as Arc<dyn EntityStore>),
            Err(e) => {
                tracing::warn!(error = %e, "Entity store unavailable");
                None
            }
        };
        let prompts = match DifyClient::from_config(&config) {
            Ok(client) => Some(Arc::new(client) as Arc<dyn PromptService>),
            Err(e) => {
                tracing::warn!(error = %e, "Prompt service unavailable");
                None
            }
        };
        let images = match MediaClient::from_config(&config) {
            Ok(client) => Some(Arc::new(client) as Arc<dyn ImageService>),
            Err(e) => {
                tracing::warn!(error = %e, "Image service unavailable");
                None
            }
        };

        let mut ctx = Self::new(config);
        ctx.store = store;
        ctx.prompts = prompts;
        ctx.images = images;
        ctx
    }

    pub fn with_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_prompts(mut self, prompts: Arc<dyn PromptService>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    pub fn with_images(mut self, images: Arc<dyn ImageService>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    /// The entity store, or a validation failure for `stage`.
    pub fn store(&self, stage: StageId) -> Result<Arc<dyn EntityStore>, StageError> {
        self.store
            .clone()
            .ok_or_else(|| StageError::validation(stage, MISSING_STORE))
    }

    pub fn prompts(&self, stage: StageId) -> Result<Arc<dyn PromptService>, StageError> {
        self.prompts
            .clone()
            .ok_or_else(|| StageError::validation(stage, MISSING_PROMPTS))
    }

    pub fn images(&self, stage: StageId) -> Result<Arc<dyn ImageService>, StageError> {
        self.images
            .clone()
            .ok_or_else(|| StageError::validation(stage, MISSING_IMAGES))
    }
}

pub(crate) const MISSING_STORE: &str =
    "entity store is not configured (set SUPABASE_URL and SUPABASE_API_KEY)";
pub(crate) const MISSING_PROMPTS: &str =
    "prompt service is not configured (set DIFY_URL and DIFY_API_KEY)";
pub(crate) const MISSING_IMAGES: &str = "image service is not configured";

/// Everything produced so far for one creator.
#[derive(Debug, Clone)]
pub struct CreatorState {
    pub creator_id: String,
    pub creator: Creator,
    pub prompt: Option<PromptOutput>,
    pub render: Option<RenderOutput>,
}

impl CreatorState {
    pub fn new(creator_id: impl Into<String>, creator: Creator) -> Self {
        Self {
            creator_id: creator_id.into(),
            creator,
            prompt: None,
            render: None,
        }
    }
}
