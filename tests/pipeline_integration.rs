//! End-to-end pipeline tests against in-memory collaborators.
//!
//! The entity store is a `MemoryStore`; the prompt and image services are
//! scripted. Backoff sleeps run on paused tokio time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use outreach_forge::cache::{CacheKey, Cacheable, ResultCache};
use outreach_forge::generation::{ImageResult, ImageService, PromptResponse, PromptService};
use outreach_forge::model::{Creator, MagnetKey, MagnetKind, MagnetRecord, Status};
use outreach_forge::pipeline::stages::{FetchOutput, PromptOutput};
use outreach_forge::pipeline::{
    ExecutionMode, PipelineConfig, PipelineOrchestrator, RunOptions, StageContext, StageId,
    StepSelection,
};
use outreach_forge::store::{upsert_magnet, EntityStore, MemoryStore};
use outreach_forge::{GenerationError, PipelineError, StageError};

/// Answers with three magnets per creator.
#[derive(Default)]
struct ScriptedPrompts {
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedPrompts {
    fn calls_for(&self, creator_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(creator_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PromptService for ScriptedPrompts {
    async fn generate(&self, creator_id: &str) -> Result<PromptResponse, GenerationError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(creator_id.to_string())
            .or_insert(0) += 1;

        let magnets: Vec<_> = (1..=3)
            .map(|i| {
                json!({
                    "context_id": format!("{}-m{}", creator_id, i),
                    "front_name": format!("Magnet {}", i),
                    "front_style_key": "retro",
                    "front_image_prompt": format!("{} prompt {}", creator_id, i),
                })
            })
            .collect();
        let answer = json!({
            "task_id": format!("task-{}", creator_id),
            "outlook": format!("Hello {}", creator_id),
            "video_prompt": "slow pan",
            "magnet_sku_list": magnets,
        });
        // Streamed as a markdown block to exercise extraction.
        PromptResponse::from_text(&format!("```json\n{}\n```", answer))
    }
}

/// Renders every prompt except those of `broken_creator`, which always
/// fails with a server error.
struct ScriptedImages {
    broken_creator: Option<String>,
    renders: AtomicUsize,
    composes: AtomicUsize,
}

impl ScriptedImages {
    fn new(broken_creator: Option<&str>) -> Self {
        Self {
            broken_creator: broken_creator.map(str::to_string),
            renders: AtomicUsize::new(0),
            composes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ImageService for ScriptedImages {
    async fn render(
        &self,
        prompt: &str,
        _reference_url: &str,
    ) -> Result<ImageResult, GenerationError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        if let Some(broken) = &self.broken_creator {
            if prompt.starts_with(&format!("{} ", broken)) {
                return Err(GenerationError::Http {
                    status: 500,
                    body: "render backend down".into(),
                });
            }
        }
        Ok(ImageResult::new(vec![format!(
            "https://img.example/{}.png",
            prompt.replace(' ', "_")
        )]))
    }

    async fn compose(
        &self,
        _prompt: &str,
        image_urls: &[String],
    ) -> Result<ImageResult, GenerationError> {
        assert_eq!(image_urls.len(), 4);
        let n = self.composes.fetch_add(1, Ordering::SeqCst);
        Ok(ImageResult::new(vec![format!("https://scene.example/{}.png", n)]))
    }
}

fn creator(id: &str, paid: i64) -> Creator {
    serde_json::from_value(json!({
        "creator_id": id,
        "name": format!("Creator {}", id),
        "paid_subscribers_est": paid,
        "status": "pending",
    }))
    .unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    prompts: Arc<ScriptedPrompts>,
    images: Arc<ScriptedImages>,
    orchestrator: PipelineOrchestrator,
}

fn harness(broken_creator: Option<&str>) -> Harness {
    let store = Arc::new(MemoryStore::with_creators(vec![
        creator("c3", 10),
        creator("c1", 30),
        creator("c2", 20),
    ]));
    let prompts = Arc::new(ScriptedPrompts::default());
    let images = Arc::new(ScriptedImages::new(broken_creator));
    let ctx = StageContext::new(PipelineConfig::default())
        .with_cache(ResultCache::in_memory())
        .with_store(store.clone())
        .with_prompts(prompts.clone())
        .with_images(images.clone());

    Harness {
        store,
        prompts,
        images,
        orchestrator: PipelineOrchestrator::new(ctx),
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_run_completes_every_creator() {
    let h = harness(None);
    let summary = h.orchestrator.run(RunOptions::new()).await.unwrap();

    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);

    for id in ["c1", "c2", "c3"] {
        assert_eq!(h.store.status_of(id), Some(Status::Completed));
        let cover = h
            .store
            .magnet(&MagnetKey::new(id, format!("{}-m1", id), MagnetKind::Cover))
            .expect("cover written");
        assert_eq!(cover.task_id, Some(format!("task-{}", id)));
        assert_eq!(
            h.store.outreach_for(id).unwrap().outreach_email_body,
            format!("Hello {}", id)
        );
    }

    // Sequential mode visits creators by audience size.
    let started: Vec<String> = h
        .store
        .status_history()
        .into_iter()
        .filter(|(_, s)| *s == Status::Generating)
        .map(|(id, _)| id)
        .collect();
    assert_eq!(started, vec!["c1", "c2", "c3"]);

    let normal = h
        .store
        .magnet(&MagnetKey::new("c2", "c2-m3", MagnetKind::Normal))
        .unwrap();
    assert_eq!(
        normal.front_image_url.as_deref(),
        Some("https://img.example/c2_prompt_3.png")
    );
}

#[tokio::test(start_paused = true)]
async fn test_one_failing_creator_does_not_stop_the_batch() {
    for mode in [ExecutionMode::Sequential, ExecutionMode::Concurrent] {
        let h = harness(Some("c2"));
        let summary = h
            .orchestrator
            .run(RunOptions::new().with_mode(mode))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 2, "mode {:?}", mode);
        assert_eq!(summary.failed, 1, "mode {:?}", mode);
        assert_eq!(summary.failed_ids(), vec!["c2"]);

        let failed = &summary.outcomes["c2"];
        assert_eq!(failed.failed_stage, Some(StageId::Render));
        assert!(failed.error.as_deref().unwrap().contains("4 attempts"));

        assert_eq!(h.store.status_of("c1"), Some(Status::Completed));
        assert_eq!(h.store.status_of("c2"), Some(Status::Failed));
        assert_eq!(h.store.status_of("c3"), Some(Status::Completed));
        assert!(h
            .store
            .magnet(&MagnetKey::new("c2", "c2-m1", MagnetKind::Cover))
            .is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn test_second_run_is_served_from_cache() {
    let h = harness(None);
    h.orchestrator.run(RunOptions::new()).await.unwrap();
    let renders = h.images.renders.load(Ordering::SeqCst);

    let summary = h.orchestrator.run(RunOptions::new()).await.unwrap();

    assert_eq!(summary.succeeded, 3);
    // Fetch plus three stages for each of three creators.
    assert_eq!(summary.cache_hits, 10);
    assert_eq!(h.prompts.calls_for("c1"), 1);
    assert_eq!(h.images.renders.load(Ordering::SeqCst), renders);
}

#[tokio::test(start_paused = true)]
async fn test_failed_creator_keeps_earlier_cache_only() {
    let h = harness(Some("c2"));
    h.orchestrator.run(RunOptions::new()).await.unwrap();

    let cache = &h.orchestrator.context().cache;
    assert!(cache
        .load_raw(&CacheKey::new("c2", StageId::Prompt))
        .await
        .is_some());
    assert!(cache
        .load_raw(&CacheKey::new("c2", StageId::Render))
        .await
        .is_none());
    assert!(cache
        .load_raw(&CacheKey::new("c1", StageId::Compose))
        .await
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn test_targeted_run_and_step_selection() {
    let h = harness(None);

    let summary = h
        .orchestrator
        .run(
            RunOptions::new()
                .with_steps(StepSelection::parse("1,2").unwrap())
                .with_creator_id("c3"),
        )
        .await
        .unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.outcomes["c3"].stages, vec![StageId::Prompt]);
    assert_eq!(h.images.renders.load(Ordering::SeqCst), 0);

    // Stages 3 and 4 only run for creators with a cached prompt result.
    let summary = h
        .orchestrator
        .run(RunOptions::new().with_steps(StepSelection::parse("3,4").unwrap()))
        .await
        .unwrap();
    assert_eq!(summary.total, 1);
    assert!(summary.outcomes["c3"].is_success());
    assert_eq!(
        summary.outcomes["c3"].stages,
        vec![StageId::Render, StageId::Compose]
    );
}

#[tokio::test]
async fn test_structural_errors_abort_the_run() {
    let h = harness(None);
    let err = h
        .orchestrator
        .run(RunOptions::new().with_creator_id("nobody"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CreatorNotFound(id) if id == "nobody"));

    let empty = PipelineOrchestrator::new(
        StageContext::new(PipelineConfig::default())
            .with_cache(ResultCache::in_memory())
            .with_store(Arc::new(MemoryStore::new())),
    );
    assert!(matches!(
        empty.run(RunOptions::new()).await,
        Err(PipelineError::NoCreators)
    ));

    let no_store = PipelineOrchestrator::new(
        StageContext::new(PipelineConfig::default()).with_cache(ResultCache::in_memory()),
    );
    assert!(matches!(
        no_store.run(RunOptions::new()).await,
        Err(PipelineError::Fetch(StageError::Validation { .. }))
    ));

    let cold = harness(None);
    let err = cold
        .orchestrator
        .run(RunOptions::new().with_steps(StepSelection::parse("2").unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::MissingCache(_)));
}

#[tokio::test]
async fn test_status_write_failures_are_ignored() {
    let h = harness(None);
    h.store.fail_status_writes(true);
    let summary = h
        .orchestrator
        .run(RunOptions::new().with_steps(StepSelection::parse("1,2").unwrap()))
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 3);
}

#[tokio::test]
async fn test_file_cache_round_trip_and_corruption() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = ResultCache::on_disk(dir.path());
    let key = CacheKey::new("c1", StageId::Prompt);

    let output = PromptOutput {
        creator_id: "c1".into(),
        task_id: "t".into(),
        outlook: "hi".into(),
        video_prompt: "pan".into(),
        message: Some("note".into()),
        magnets: vec![],
        saved: vec!["m1".into()],
        errors: vec![],
        outreach_written: true,
    };
    assert!(cache.save(&key, &output).await);
    assert_eq!(cache.load::<PromptOutput>(&key).await, Some(output.clone()));

    let path = dir.path().join(key.file_name());
    std::fs::write(&path, b"{not json").unwrap();
    assert_eq!(cache.load::<PromptOutput>(&key).await, None);
    assert!(!path.exists());

    assert!(cache.save(&key, &output).await);
    assert_eq!(cache.load::<PromptOutput>(&key).await, Some(output));
}

#[tokio::test]
async fn test_empty_results_are_never_cached() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = ResultCache::on_disk(dir.path());
    let empty = FetchOutput {
        creators: vec![],
        fetched_at: chrono::Utc::now(),
    };
    assert_eq!(empty.success_count(), 0);

    assert!(!cache.save(&CacheKey::all_creators(), &empty).await);
    assert!(cache
        .load::<FetchOutput>(&CacheKey::all_creators())
        .await
        .is_none());
}

#[tokio::test]
async fn test_upsert_twice_keeps_one_record() {
    let store = MemoryStore::new();
    let key = MagnetKey::new("c1", "m1", MagnetKind::Normal);

    let mut first = MagnetRecord::new(&key);
    first.front_name = Some("First".into());
    let mut second = MagnetRecord::new(&key);
    second.front_name = Some("Second".into());

    upsert_magnet(&store, &first).await.unwrap();
    upsert_magnet(&store, &second).await.unwrap();

    let records = store.magnets();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].front_name.as_deref(), Some("Second"));
    assert_eq!(store.write_counts(), (1, 1));
    assert!(store.find_magnet(&key).await.unwrap().is_some());
}
