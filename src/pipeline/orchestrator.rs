//! Pipeline orchestrator for driving creators through the stages.
//!
//! This module provides the main `PipelineOrchestrator` that coordinates:
//! - The batch-wide fetch (or its cached copy)
//! - Per-creator runs of the prompt, render and compose stages
//! - Creator status transitions
//! - Failure isolation and the run summary

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::{CacheKey, Cacheable};
use crate::error::{PipelineError, StageError};
use crate::model::Status;
use crate::scheduler::WorkerPool;
use crate::store::StatusStore;

use super::context::{CreatorState, StageContext};
use super::ordering::EntityOrderer;
use super::stage::{Stage, StageId, StageRun};
use super::stages::{
    ComposeStage, FetchOutput, FetchStage, PromptOutput, PromptStage, RenderOutput, RenderStage,
};

/// Which stages a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSelection(BTreeSet<StageId>);

impl StepSelection {
    pub fn all() -> Self {
        Self(StageId::ALL.into_iter().collect())
    }

    pub fn only(stages: impl IntoIterator<Item = StageId>) -> Self {
        Self(stages.into_iter().collect())
    }

    /// Parses a comma-separated subset of `1,2,3,4`.
    pub fn parse(spec: &str) -> Result<Self, PipelineError> {
        let invalid = || PipelineError::InvalidSteps(spec.to_string());
        let mut stages = BTreeSet::new();
        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let number: u8 = token.parse().map_err(|_| invalid())?;
            stages.insert(StageId::from_number(number).ok_or_else(invalid)?);
        }
        if stages.is_empty() {
            return Err(invalid());
        }
        Ok(Self(stages))
    }

    pub fn contains(&self, stage: StageId) -> bool {
        self.0.contains(&stage)
    }

    pub fn stages(&self) -> impl Iterator<Item = StageId> + '_ {
        self.0.iter().copied()
    }

    /// Whether any per-creator stage is selected.
    pub fn has_creator_stages(&self) -> bool {
        self.stages().any(|s| s != StageId::Fetch)
    }
}

impl Default for StepSelection {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for StepSelection {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for StepSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let numbers: Vec<String> = self.stages().map(|s| s.number().to_string()).collect();
        f.write_str(&numbers.join(","))
    }
}

/// How creators are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One creator at a time, in order.
    #[default]
    Sequential,
    /// Up to `max_concurrent_creators` at once; no cross-creator ordering.
    Concurrent,
}

/// Options for one batch run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub steps: StepSelection,
    pub creator_id: Option<String>,
    pub mode: ExecutionMode,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_steps(mut self, steps: StepSelection) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_creator_id(mut self, creator_id: impl Into<String>) -> Self {
        self.creator_id = Some(creator_id.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Result of one creator's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatorOutcome {
    /// `completed` or `failed`.
    pub status: Status,
    /// Stages that produced output, in order.
    pub stages: Vec<StageId>,
    /// Stages served from the cache.
    pub cached: Vec<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl CreatorOutcome {
    fn new() -> Self {
        Self {
            status: Status::Generating,
            stages: Vec::new(),
            cached: Vec::new(),
            failed_stage: None,
            error: None,
            duration_ms: 0,
        }
    }

    fn record<T>(&mut self, stage: StageId, run: &StageRun<T>) {
        self.stages.push(stage);
        if run.from_cache {
            self.cached.push(stage);
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Completed
    }
}

/// Summary of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: String,
    pub mode: ExecutionMode,
    /// Creators in the fetched (or cached) list.
    pub fetched: usize,
    /// Creators dispatched to the per-creator stages.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Stage runs answered from the cache, the fetch included.
    pub cache_hits: usize,
    pub outcomes: BTreeMap<String, CreatorOutcome>,
}

impl BatchSummary {
    fn new(run_id: Uuid, options: &RunOptions) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            steps: options.steps.to_string(),
            mode: options.mode,
            fetched: 0,
            total: 0,
            succeeded: 0,
            failed: 0,
            cache_hits: 0,
            outcomes: BTreeMap::new(),
        }
    }

    fn record(&mut self, creator_id: String, outcome: CreatorOutcome) {
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.cache_hits += outcome.cached.len();
        self.outcomes.insert(creator_id, outcome);
    }

    /// Creator ids that failed, in id order.
    pub fn failed_ids(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_success())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Runs the per-creator stages for one creator.
#[derive(Clone)]
struct CreatorRunner {
    ctx: StageContext,
    status: Option<StatusStore>,
    steps: StepSelection,
}

impl CreatorRunner {
    async fn set_status(&self, creator_id: &str, status: Status) {
        if let Some(store) = &self.status {
            store.set_status(creator_id, status).await;
        }
    }

    async fn run(&self, mut state: CreatorState) -> (String, CreatorOutcome) {
        let creator_id = state.creator_id.clone();
        let started = Instant::now();
        let mut outcome = CreatorOutcome::new();

        self.set_status(&creator_id, Status::Generating).await;
        tracing::info!(steps = %self.steps, "Processing creator");

        match self.run_stages(&mut state, &mut outcome).await {
            Ok(()) => {
                outcome.status = Status::Completed;
                self.set_status(&creator_id, Status::Completed).await;
                tracing::info!("Creator completed");
            }
            Err((stage, err)) => {
                tracing::error!(stage = %stage, error = %err, "Creator failed");
                outcome.status = Status::Failed;
                outcome.failed_stage = Some(stage);
                outcome.error = Some(err.to_string());
                self.set_status(&creator_id, Status::Failed).await;
            }
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        (creator_id, outcome)
    }

    async fn run_stages(
        &self,
        state: &mut CreatorState,
        outcome: &mut CreatorOutcome,
    ) -> Result<(), (StageId, StageError)> {
        let ctx = &self.ctx;

        if self.steps.contains(StageId::Prompt) {
            let run = PromptStage
                .run(ctx, state)
                .await
                .map_err(|e| (StageId::Prompt, e))?;
            outcome.record(StageId::Prompt, &run);
            state.prompt = Some(run.output);
        } else if state.prompt.is_none() && self.steps.contains(StageId::Render) {
            return Err(missing_cache(StageId::Prompt, &state.creator_id));
        }

        if self.steps.contains(StageId::Render) {
            let run = RenderStage
                .run(ctx, state)
                .await
                .map_err(|e| (StageId::Render, e))?;
            outcome.record(StageId::Render, &run);
            state.render = Some(run.output);
        } else if self.steps.contains(StageId::Compose) {
            let key = CacheKey::new(&state.creator_id, StageId::Render);
            state.render = ctx.cache.load::<RenderOutput>(&key).await;
            if state.render.is_none() {
                return Err(missing_cache(StageId::Render, &state.creator_id));
            }
        }

        if self.steps.contains(StageId::Compose) {
            let run = ComposeStage
                .run(ctx, state)
                .await
                .map_err(|e| (StageId::Compose, e))?;
            outcome.record(StageId::Compose, &run);
        }

        Ok(())
    }
}

fn missing_cache(stage: StageId, creator_id: &str) -> (StageId, StageError) {
    (
        stage,
        StageError::MissingCache {
            stage,
            creator_id: creator_id.to_string(),
        },
    )
}

/// Main pipeline orchestrator that coordinates all stages.
pub struct PipelineOrchestrator {
    ctx: StageContext,
    status: Option<StatusStore>,
    creators: WorkerPool,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator over `ctx`. Status writes go to the context's
    /// store when one is configured.
    pub fn new(ctx: StageContext) -> Self {
        let status = ctx.store.clone().map(StatusStore::new);
        let creators = WorkerPool::new("creators", ctx.config.max_concurrent_creators);
        Self {
            ctx,
            status,
            creators,
        }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Runs a batch.
    ///
    /// Per-creator failures are recorded in the summary and never abort the
    /// batch.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` only for structural problems: the fetch
    /// failed, no creators exist, the requested creator is unknown, or a
    /// skipped stage's cache record is missing for the whole batch.
    pub async fn run(&self, options: RunOptions) -> Result<BatchSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("batch", run_id = %run_id);
        self.run_batch(run_id, options).instrument(span).await
    }

    async fn run_batch(
        &self,
        run_id: Uuid,
        options: RunOptions,
    ) -> Result<BatchSummary, PipelineError> {
        let mut summary = BatchSummary::new(run_id, &options);
        tracing::info!(steps = %options.steps, mode = ?options.mode, "Starting pipeline run");

        let (fetched, from_cache) = self.load_creators(&options.steps).await?;
        if from_cache {
            summary.cache_hits += 1;
        }
        summary.fetched = fetched.creators.len();
        if fetched.creators.is_empty() {
            return Err(PipelineError::NoCreators);
        }

        let mut creators = fetched.creators;
        if let Some(id) = options.creator_id.as_deref() {
            creators = EntityOrderer::filter_by_id(creators, id);
            if creators.is_empty() {
                return Err(PipelineError::CreatorNotFound(id.to_string()));
            }
        }

        if !options.steps.has_creator_stages() {
            summary.finished_at = Utc::now();
            tracing::info!(fetched = summary.fetched, "Fetch-only run finished");
            return Ok(summary);
        }

        let states = self.prepare_states(creators, &options.steps).await?;
        summary.total = states.len();

        let runner = CreatorRunner {
            ctx: self.ctx.clone(),
            status: self.status.clone(),
            steps: options.steps.clone(),
        };
        let aggregate = Arc::new(Mutex::new(summary));

        match options.mode {
            ExecutionMode::Sequential => {
                for state in states {
                    let span = tracing::info_span!("creator", creator_id = %state.creator_id);
                    let (id, outcome) = runner.run(state).instrument(span).await;
                    aggregate.lock().await.record(id, outcome);
                }
            }
            ExecutionMode::Concurrent => {
                let ids: Vec<String> = states.iter().map(|s| s.creator_id.clone()).collect();
                let results = self
                    .creators
                    .run_all(states, |state| {
                        let runner = runner.clone();
                        let aggregate = Arc::clone(&aggregate);
                        let span = tracing::info_span!("creator", creator_id = %state.creator_id);
                        async move {
                            let (id, outcome) = runner.run(state).await;
                            aggregate.lock().await.record(id, outcome);
                        }
                        .instrument(span)
                    })
                    .await;

                for (id, result) in ids.into_iter().zip(results) {
                    if let Err(e) = result {
                        let mut outcome = CreatorOutcome::new();
                        outcome.status = Status::Failed;
                        outcome.error = Some(e.to_string());
                        if let Some(status) = &self.status {
                            status.set_status(&id, Status::Failed).await;
                        }
                        aggregate.lock().await.record(id, outcome);
                    }
                }
            }
        }

        let mut summary = aggregate.lock().await.clone();
        summary.finished_at = Utc::now();
        tracing::info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cache_hits = summary.cache_hits,
            "Pipeline run finished"
        );
        Ok(summary)
    }

    /// Runs the fetch, or reads its cache record when fetch is not selected.
    async fn load_creators(
        &self,
        steps: &StepSelection,
    ) -> Result<(FetchOutput, bool), PipelineError> {
        if steps.contains(StageId::Fetch) {
            let run = FetchStage
                .run(&self.ctx, &())
                .await
                .map_err(PipelineError::Fetch)?;
            return Ok((run.output, run.from_cache));
        }

        let key = CacheKey::all_creators();
        match self.ctx.cache.load::<FetchOutput>(&key).await {
            Some(output) if output.success_count() > 0 => Ok((output, true)),
            _ => Err(PipelineError::MissingCache(key.to_string())),
        }
    }

    /// Builds per-creator state, loading cached prompt output when the
    /// prompt stage is skipped.
    async fn prepare_states(
        &self,
        creators: Vec<crate::model::Creator>,
        steps: &StepSelection,
    ) -> Result<Vec<CreatorState>, PipelineError> {
        let mut states = Vec::with_capacity(creators.len());
        let mut seen = HashSet::new();
        for creator in creators {
            let Some(id) = creator.key() else {
                continue;
            };
            if !seen.insert(id.clone()) {
                tracing::warn!(creator_id = %id, "Duplicate creator row, skipping");
                continue;
            }
            states.push(CreatorState::new(id, creator));
        }

        if steps.contains(StageId::Prompt) {
            return Ok(states);
        }

        let needs_prompt = steps.contains(StageId::Render);
        let mut kept = Vec::with_capacity(states.len());
        for mut state in states {
            let key = CacheKey::new(&state.creator_id, StageId::Prompt);
            state.prompt = self.ctx.cache.load::<PromptOutput>(&key).await;
            if needs_prompt && state.prompt.is_none() {
                tracing::warn!(creator_id = %state.creator_id, "No step_two cache record, skipping creator");
                continue;
            }
            kept.push(state);
        }

        if kept.is_empty() {
            return Err(PipelineError::MissingCache(format!(
                "no creator has a {} record",
                StageId::Prompt
            )));
        }
        Ok(kept)
    }
}
