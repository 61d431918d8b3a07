//! Stage 4: compose three rendered magnets into a cover scene.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::{CacheKey, Cacheable};
use crate::error::{GenerationError, StageError};
use crate::generation::ImageResult;
use crate::model::{MagnetKey, MagnetKind, MagnetRecord};
use crate::pipeline::context::{CreatorState, StageContext, MISSING_IMAGES, MISSING_STORE};
use crate::pipeline::stage::{Stage, StageId};
use crate::retry::{RetryError, RetryPolicy};
use crate::store::upsert_magnet;

/// Number of magnets placed on one cover.
pub const SCENE_MAGNETS: usize = 3;

/// Scene instruction sent with every composition request.
pub const SCENE_PROMPT: &str = "The first image is a template; replace three refrigerator magnets on it.\
Extreme close-up cinematic shot of three different fridge magnets,
each magnet appearing as a separate frozen moment,
clean minimalist product design, no extra decoration,
perfectly aligned on a modern refrigerator door.

All magnets:
- same scale and visual weight
- consistent lighting and shadow direction
- flush against the fridge surface
- premium matte or semi-matte finish

Strong constraints: Stacked panels + transparent glossy adhesive surface, high gloss.

Environment:
modern minimalist kitchen,
soft early morning natural light,
subtle reflections on fridge surface,
shallow depth of field,
cinematic realism

size：16:9, 4k.";

/// A magnet image placed on the cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSource {
    pub context_id: String,
    pub front_name: String,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeOutput {
    pub creator_id: String,
    pub sources: Vec<SceneSource>,
    pub template_url: String,
    pub cover_urls: Vec<String>,
    #[serde(default)]
    pub texts: Vec<Value>,
    /// `context_id`s of the cover records written.
    #[serde(default)]
    pub written: Vec<String>,
}

impl Cacheable for ComposeOutput {
    fn success_count(&self) -> usize {
        self.cover_urls.len()
    }
}

/// Chooses a template by a stable hash of the creator id.
pub fn pick_template<'a>(templates: &'a [String], creator_id: &str) -> Option<&'a str> {
    if templates.is_empty() {
        return None;
    }
    let digest = Sha256::digest(creator_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let index = (u64::from_be_bytes(prefix) % templates.len() as u64) as usize;
    tracing::trace!(creator_id, digest = %hex::encode(prefix), index, "Picked scene template");
    templates.get(index).map(String::as_str)
}

/// `context_id` of the `n`th (1-based) cover when `total` were composed.
fn cover_context_id(base: &str, n: usize, total: usize) -> String {
    if total > 1 {
        format!("{}_SCENE_{}", base, n)
    } else {
        base.to_string()
    }
}

/// Composes the first three rendered magnets onto a template image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComposeStage;

impl ComposeStage {
    /// Task id from the prompt output, else from the stored record of `context_id`.
    async fn task_id(
        &self,
        ctx: &StageContext,
        input: &CreatorState,
        context_id: &str,
    ) -> Result<Option<String>, StageError> {
        if let Some(prompt) = &input.prompt {
            return Ok(Some(prompt.task_id.clone()));
        }
        let store = ctx.store(self.id())?;
        let key = MagnetKey::new(&input.creator_id, context_id, MagnetKind::Normal);
        Ok(store.find_magnet(&key).await?.and_then(|r| r.task_id))
    }
}

#[async_trait]
impl Stage for ComposeStage {
    type Input = CreatorState;
    type Output = ComposeOutput;

    fn id(&self) -> StageId {
        StageId::Compose
    }

    fn cache_key(&self, input: &CreatorState) -> CacheKey {
        CacheKey::new(&input.creator_id, self.id())
    }

    fn validate(&self, ctx: &StageContext, input: &CreatorState) -> Result<(), String> {
        let rendered = input.render.as_ref().map_or(0, |r| r.rendered().count());
        if rendered < SCENE_MAGNETS {
            return Err(format!(
                "only {} rendered magnets, at least {} are required",
                rendered, SCENE_MAGNETS
            ));
        }
        if ctx.config.scene_template_urls.is_empty() {
            return Err("no scene template configured".to_string());
        }
        if ctx.images.is_none() {
            return Err(MISSING_IMAGES.to_string());
        }
        if ctx.store.is_none() {
            return Err(MISSING_STORE.to_string());
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        input: &CreatorState,
    ) -> Result<ComposeOutput, StageError> {
        self.ensure_valid(ctx, input)?;
        let images = ctx.images(self.id())?;
        let store = ctx.store(self.id())?;

        let rendered: Vec<_> = input
            .render
            .iter()
            .flat_map(|r| r.rendered())
            .take(SCENE_MAGNETS)
            .collect();
        let (Some(first), true) = (rendered.first(), rendered.len() == SCENE_MAGNETS) else {
            return Err(StageError::validation(self.id(), "not enough rendered magnets"));
        };

        let sources: Vec<SceneSource> = rendered
            .iter()
            .filter_map(|m| {
                m.front_image_url.as_ref().map(|url| SceneSource {
                    context_id: m.context_id.clone(),
                    front_name: m.front_name.clone(),
                    image_url: url.clone(),
                })
            })
            .collect();

        let template_url = pick_template(&ctx.config.scene_template_urls, &input.creator_id)
            .ok_or_else(|| StageError::validation(self.id(), "no scene template configured"))?
            .to_string();

        let mut image_urls = vec![template_url.clone()];
        image_urls.extend(sources.iter().map(|s| s.image_url.clone()));

        let policy = RetryPolicy::compose(ctx.config.long_backoff);
        let service = images.as_ref();
        let urls = image_urls.as_slice();
        let result = policy
            .run(
                |attempt| async move {
                    tracing::info!(attempt, "Composing cover scene");
                    service
                        .compose(SCENE_PROMPT, urls)
                        .await
                        .and_then(ImageResult::require_urls)
                },
                GenerationError::is_transient,
            )
            .await;

        let composed = match result {
            Ok(done) => done.value,
            Err(RetryError::Exhausted { attempts, last, .. }) => {
                return Err(StageError::Exhausted {
                    stage: self.id(),
                    attempts,
                    last: last.to_string(),
                })
            }
            Err(RetryError::Fatal { attempt, error }) => {
                return Err(StageError::Rejected {
                    stage: self.id(),
                    attempt,
                    reason: error.to_string(),
                })
            }
        };

        let cover_urls: Vec<String> = composed
            .urls
            .into_iter()
            .filter(|u| !u.trim().is_empty())
            .collect();

        let mut written = Vec::new();
        match self.task_id(ctx, input, &first.context_id).await? {
            Some(task_id) => {
                for (n, url) in cover_urls.iter().enumerate() {
                    let context_id = cover_context_id(&first.context_id, n + 1, cover_urls.len());
                    let key = MagnetKey::new(&input.creator_id, &context_id, MagnetKind::Cover);
                    let mut record = MagnetRecord::new(&key);
                    record.task_id = Some(task_id.clone());
                    record.front_name = Some(first.front_name.clone());
                    record.front_style_key = Some(first.front_style_key.clone());
                    record.front_image_prompt = Some(first.front_image_prompt.clone());
                    record.front_image_url = Some(url.clone());

                    let outcome = upsert_magnet(store.as_ref(), &record).await?;
                    tracing::info!(context_id = %context_id, ?outcome, "Cover saved");
                    written.push(context_id);
                }
            }
            None => tracing::warn!(
                context_id = %first.context_id,
                "No task_id found, cover not written to the store"
            ),
        }

        Ok(ComposeOutput {
            creator_id: input.creator_id.clone(),
            sources,
            template_url,
            cover_urls,
            texts: composed.texts,
            written,
        })
    }
}
