//! Stage 3: render one image per magnet and write it back.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::cache::{CacheKey, Cacheable};
use crate::error::{GenerationError, StageError};
use crate::generation::{ImageResult, ImageService};
use crate::model::{Creator, ItemError, Magnet, MagnetKey, MagnetKind, MagnetRecord};
use crate::pipeline::context::{CreatorState, StageContext, MISSING_IMAGES, MISSING_STORE};
use crate::pipeline::stage::{Stage, StageId};
use crate::retry::{RetryError, RetryPolicy};
use crate::store::{upsert_magnet, EntityStore};

/// One successful image of a magnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    /// 1-based image number within the magnet.
    pub index: usize,
    pub urls: Vec<String>,
    #[serde(default)]
    pub texts: Vec<Value>,
    pub attempts: u32,
}

/// Render result for one magnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedMagnet {
    pub context_id: String,
    pub front_name: String,
    pub front_style_key: String,
    pub front_image_prompt: String,
    pub reference_url: String,
    /// First URL of the first successful image.
    pub front_image_url: Option<String>,
    pub images: Vec<GeneratedImage>,
    #[serde(default)]
    pub errors: Vec<ItemError>,
    /// Whether `front_image_url` reached the store.
    #[serde(default)]
    pub stored: bool,
}

impl RenderedMagnet {
    pub fn is_rendered(&self) -> bool {
        self.front_image_url.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderOutput {
    pub creator_id: String,
    /// Every attempted magnet, in prompt answer order.
    pub magnets: Vec<RenderedMagnet>,
    /// Magnets that could not be attempted.
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

impl RenderOutput {
    /// Magnets with an image, in order.
    pub fn rendered(&self) -> impl Iterator<Item = &RenderedMagnet> {
        self.magnets.iter().filter(|m| m.is_rendered())
    }
}

impl Cacheable for RenderOutput {
    fn success_count(&self) -> usize {
        self.rendered().count()
    }
}

/// Reference image for a magnet: its logo, else the creator's signature
/// image, else the configured default.
pub(crate) fn reference_url(magnet: &Magnet, creator: &Creator, default_url: &str) -> String {
    [
        magnet.front_logo_url.as_deref(),
        creator.creator_signature_image_url.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|url| !url.is_empty())
    .unwrap_or(default_url)
    .to_string()
}

#[derive(Debug, Clone)]
struct RenderJob {
    creator_id: String,
    task_id: String,
    magnet: Magnet,
    reference_url: String,
}

/// Renders `images_per_magnet` images for every saved magnet.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderStage;

impl RenderStage {
    async fn render_magnet(
        images: Arc<dyn ImageService>,
        store: Arc<dyn EntityStore>,
        policy: RetryPolicy,
        count: usize,
        job: RenderJob,
    ) -> RenderedMagnet {
        let RenderJob {
            creator_id,
            task_id,
            magnet,
            reference_url,
        } = job;

        let mut generated = Vec::new();
        let mut errors = Vec::new();
        let service = images.as_ref();
        let prompt = magnet.front_image_prompt.as_str();
        let reference = reference_url.as_str();

        for index in 1..=count {
            let result = policy
                .run(
                    |attempt| async move {
                        tracing::debug!(attempt, image = index, "Rendering magnet image");
                        service
                            .render(prompt, reference)
                            .await
                            .and_then(ImageResult::require_urls)
                    },
                    GenerationError::is_transient,
                )
                .await;

            match result {
                Ok(done) => generated.push(GeneratedImage {
                    index,
                    urls: done
                        .value
                        .urls
                        .into_iter()
                        .filter(|u| !u.trim().is_empty())
                        .collect(),
                    texts: done.value.texts,
                    attempts: done.attempts,
                }),
                Err(RetryError::Fatal { attempt, error }) => {
                    tracing::warn!(image = index, attempt, error = %error, "Magnet image rejected");
                    errors.push(
                        ItemError::new(&magnet.context_id, error)
                            .with_attempts(attempt)
                            .fatal(),
                    );
                }
                Err(e) => {
                    tracing::warn!(image = index, error = %e, "Magnet image failed");
                    let attempts = e.attempts();
                    errors.push(ItemError::new(&magnet.context_id, &e).with_attempts(attempts));
                }
            }
        }

        let front_image_url = generated.first().and_then(|g| g.urls.first()).cloned();

        let mut stored = false;
        if let Some(url) = &front_image_url {
            let key = MagnetKey::new(&creator_id, &magnet.context_id, MagnetKind::Normal);
            let mut record = MagnetRecord::new(&key);
            record.task_id = Some(task_id);
            record.front_name = Some(magnet.front_name.clone());
            record.front_style_key = Some(magnet.front_style_key.clone());
            record.front_image_prompt = Some(magnet.front_image_prompt.clone());
            record.front_image_url = Some(url.clone());

            match upsert_magnet(store.as_ref(), &record).await {
                Ok(_) => stored = true,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to write front_image_url");
                    errors.push(ItemError::new(&magnet.context_id, e));
                }
            }
        }

        RenderedMagnet {
            context_id: magnet.context_id,
            front_name: magnet.front_name,
            front_style_key: magnet.front_style_key,
            front_image_prompt: magnet.front_image_prompt,
            reference_url,
            front_image_url,
            images: generated,
            errors,
            stored,
        }
    }
}

#[async_trait]
impl Stage for RenderStage {
    type Input = CreatorState;
    type Output = RenderOutput;

    fn id(&self) -> StageId {
        StageId::Render
    }

    fn cache_key(&self, input: &CreatorState) -> CacheKey {
        CacheKey::new(&input.creator_id, self.id())
    }

    fn validate(&self, ctx: &StageContext, input: &CreatorState) -> Result<(), String> {
        let Some(prompt) = &input.prompt else {
            return Err("prompt output is missing; run step_two first".to_string());
        };
        if prompt.magnets.is_empty() {
            return Err("prompt output has no magnets".to_string());
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
    ) -> Result<RenderOutput, StageError> {
        self.ensure_valid(ctx, input)?;
        let images = ctx.images(self.id())?;
        let store = ctx.store(self.id())?;
        let Some(prompt) = &input.prompt else {
            return Err(StageError::validation(self.id(), "prompt output is missing"));
        };

        // Older cache records may predate `saved`; treat every magnet as saved then.
        let only_saved = !prompt.saved.is_empty();
        let mut errors = Vec::new();
        let mut jobs = Vec::new();
        for magnet in &prompt.magnets {
            if only_saved && !prompt.is_saved(&magnet.context_id) {
                continue;
            }
            if magnet.front_name.trim().is_empty() {
                tracing::warn!(context_id = %magnet.context_id, "Magnet has no front_name, skipping");
                continue;
            }
            if magnet.front_image_prompt.trim().is_empty() {
                errors.push(ItemError::new(&magnet.context_id, "magnet has no front_image_prompt"));
                continue;
            }
            jobs.push(RenderJob {
                creator_id: input.creator_id.clone(),
                task_id: prompt.task_id.clone(),
                magnet: magnet.clone(),
                reference_url: reference_url(magnet, &input.creator, &ctx.config.default_image_url),
            });
        }

        tracing::info!(magnets = jobs.len(), "Rendering magnets");

        let policy = RetryPolicy::render(ctx.config.short_backoff, ctx.config.long_backoff);
        let count = ctx.config.images_per_magnet.max(1);
        let context_ids: Vec<String> = jobs.iter().map(|j| j.magnet.context_id.clone()).collect();
        let span = tracing::Span::current();

        let results = ctx
            .calls
            .run_all(jobs, |job| {
                let context_id = job.magnet.context_id.clone();
                Self::render_magnet(images.clone(), store.clone(), policy.clone(), count, job)
                    .instrument(tracing::info_span!(parent: &span, "magnet", context_id = %context_id))
            })
            .await;

        let mut magnets = Vec::new();
        for (context_id, result) in context_ids.into_iter().zip(results) {
            match result {
                Ok(magnet) => magnets.push(magnet),
                Err(e) => errors.push(ItemError::new(context_id, e)),
            }
        }

        let output = RenderOutput {
            creator_id: input.creator_id.clone(),
            magnets,
            errors,
        };

        let rendered = output.success_count();
        tracing::info!(rendered, attempted = output.magnets.len(), "Render finished");

        if rendered == 0 {
            let last = output.magnets.iter().flat_map(|m| m.errors.iter()).last();
            return Err(match last {
                Some(e) if e.fatal => StageError::Rejected {
                    stage: self.id(),
                    attempt: e.attempts,
                    reason: e.error.clone(),
                },
                Some(e) => StageError::Exhausted {
                    stage: self.id(),
                    attempts: e.attempts,
                    last: e.error.clone(),
                },
                None => StageError::NoSuccess {
                    stage: self.id(),
                    creator_id: input.creator_id.clone(),
                },
            });
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::pipeline::stages::PromptOutput;
    use crate::pipeline::PipelineConfig;
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails the first `failures[prompt]` calls for a prompt, then succeeds.
    /// Failures are an empty URL list unless `failure` is set.
    #[derive(Default)]
    struct FlakyImages {
        failures: HashMap<String, u32>,
        failure: Option<fn() -> GenerationError>,
        calls: Mutex<HashMap<String, u32>>,
        total: AtomicU32,
    }

    #[async_trait]
    impl ImageService for FlakyImages {
        async fn render(
            &self,
            prompt: &str,
            reference_url: &str,
        ) -> Result<ImageResult, GenerationError> {
            self.total.fetch_add(1, Ordering::SeqCst);
            let seen = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(prompt.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            let fail_for = self.failures.get(prompt).copied().unwrap_or(0);
            if seen <= fail_for {
                return match self.failure {
                    Some(error) => Err(error()),
                    None => Ok(ImageResult::new(vec![])),
                };
            }
            Ok(ImageResult::new(vec![format!("https://img/{}/{}", prompt, reference_url.len())]))
        }

        async fn compose(
            &self,
            _prompt: &str,
            _image_urls: &[String],
        ) -> Result<ImageResult, GenerationError> {
            Err(GenerationError::EmptyResult)
        }
    }

    fn magnet(ctx: &str, name: &str, prompt: &str) -> Magnet {
        Magnet {
            context_id: ctx.into(),
            front_name: name.into(),
            front_style_key: "retro".into(),
            front_image_prompt: prompt.into(),
            ..Default::default()
        }
    }

    fn state(magnets: Vec<Magnet>) -> CreatorState {
        let saved = magnets.iter().map(|m| m.context_id.clone()).collect();
        let mut state = CreatorState::new("c1", Creator::default());
        state.prompt = Some(PromptOutput {
            creator_id: "c1".into(),
            task_id: "t-9".into(),
            outlook: String::new(),
            video_prompt: String::new(),
            message: None,
            magnets,
            saved,
            errors: vec![],
            outreach_written: false,
        });
        state
    }

    fn context(images: Arc<FlakyImages>, store: Arc<MemoryStore>) -> StageContext {
        StageContext::new(PipelineConfig::default())
            .with_cache(ResultCache::in_memory())
            .with_store(store)
            .with_images(images)
    }

    #[test]
    fn test_reference_url_fallbacks() {
        let mut m = magnet("m1", "One", "p");
        let mut creator = Creator::default();
        assert_eq!(reference_url(&m, &creator, "default"), "default");

        creator.creator_signature_image_url = Some("https://sig".into());
        assert_eq!(reference_url(&m, &creator, "default"), "https://sig");

        m.front_logo_url = Some("  ".into());
        assert_eq!(reference_url(&m, &creator, "default"), "https://sig");

        m.front_logo_url = Some("https://logo".into());
        assert_eq!(reference_url(&m, &creator, "default"), "https://logo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_renders_and_writes_back() {
        let images = Arc::new(FlakyImages {
            failures: HashMap::from([("p2".to_string(), 2)]),
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        let ctx = context(images.clone(), store.clone());

        let run = RenderStage
            .run(&ctx, &state(vec![magnet("m1", "One", "p1"), magnet("m2", "Two", "p2")]))
            .await
            .unwrap();

        let output = run.output;
        assert_eq!(output.success_count(), 2);
        assert_eq!(output.magnets[1].images[0].attempts, 3);
        assert!(output.magnets.iter().all(|m| m.stored));

        let record = store
            .magnet(&MagnetKey::new("c1", "m2", MagnetKind::Normal))
            .unwrap();
        assert_eq!(record.front_image_url, output.magnets[1].front_image_url);
        assert_eq!(record.task_id.as_deref(), Some("t-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_and_missing_prompts() {
        let images = Arc::new(FlakyImages::default());
        let ctx = context(images, Arc::new(MemoryStore::new()));

        let output = RenderStage
            .execute(
                &ctx,
                &state(vec![
                    magnet("m1", "", "p1"),
                    magnet("m2", "Two", ""),
                    magnet("m3", "Three", "p3"),
                ]),
            )
            .await
            .unwrap();

        assert_eq!(output.magnets.len(), 1);
        assert_eq!(output.magnets[0].context_id, "m3");
        assert_eq!(output.errors.len(), 1);
        assert_eq!(output.errors[0].context_id, "m2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_fails_without_caching() {
        let images = Arc::new(FlakyImages {
            failures: HashMap::from([("p1".to_string(), u32::MAX)]),
            ..Default::default()
        });
        let ctx = context(images.clone(), Arc::new(MemoryStore::new()));
        let started = tokio::time::Instant::now();

        let err = RenderStage
            .run(&ctx, &state(vec![magnet("m1", "One", "p1")]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StageError::Exhausted {
                stage: StageId::Render,
                attempts: 4,
                ..
            }
        ));
        assert_eq!(images.total.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_secs(14));
        assert!(ctx
            .cache
            .load_raw(&CacheKey::new("c1", StageId::Render))
            .await
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_retried() {
        let images = Arc::new(FlakyImages {
            failures: HashMap::from([("p1".to_string(), 2)]),
            failure: Some(|| GenerationError::Http {
                status: 400,
                body: "rate shaping".into(),
            }),
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        let ctx = context(images.clone(), store.clone());

        let output = RenderStage
            .execute(&ctx, &state(vec![magnet("m1", "One", "p1")]))
            .await
            .unwrap();

        assert_eq!(images.total.load(Ordering::SeqCst), 3);
        assert!(output.magnets[0].is_rendered());
        assert_eq!(output.magnets[0].images[0].attempts, 3);
        assert!(store
            .magnet(&MagnetKey::new("c1", "m1", MagnetKind::Normal))
            .and_then(|r| r.front_image_url)
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_config_is_rejected_not_exhausted() {
        let images = Arc::new(FlakyImages {
            failures: HashMap::from([("p1".to_string(), u32::MAX)]),
            failure: Some(|| GenerationError::MissingConfig("IMAGE_API_URL")),
            ..Default::default()
        });
        let ctx = context(images.clone(), Arc::new(MemoryStore::new()));

        let err = RenderStage
            .execute(&ctx, &state(vec![magnet("m1", "One", "p1")]))
            .await
            .unwrap_err();

        assert_eq!(images.total.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            StageError::Rejected {
                stage: StageId::Render,
                attempt: 1,
                ..
            }
        ));
        assert!(!err.to_string().contains("gave up"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_back_failure_is_not_fatal() {
        let images = Arc::new(FlakyImages::default());
        let store = Arc::new(MemoryStore::new());
        store.fail_magnet_writes_for("m1");
        let ctx = context(images, store);

        let output = RenderStage
            .execute(&ctx, &state(vec![magnet("m1", "One", "p1")]))
            .await
            .unwrap();
        assert!(output.magnets[0].is_rendered());
        assert!(!output.magnets[0].stored);
        assert_eq!(output.magnets[0].errors.len(), 1);
    }

    #[tokio::test]
    async fn test_requires_prompt_output() {
        let ctx = context(Arc::new(FlakyImages::default()), Arc::new(MemoryStore::new()));
        let input = CreatorState::new("c1", Creator::default());
        assert!(RenderStage.validate(&ctx, &input).is_err());

        let empty = state(vec![]);
        let reason = RenderStage.validate(&ctx, &empty).unwrap_err();
        assert!(reason.contains("no magnets"));
    }
}
