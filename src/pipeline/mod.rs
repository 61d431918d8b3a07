//! Pipeline orchestration for creator outreach generation.
//!
//! This module drives each creator through four ordered stages and keeps the
//! creator's status field in step with its progress.
//!
//! # Architecture
//!
//! The pipeline consists of several components:
//!
//! - **Config**: [`PipelineConfig`], built once at startup and shared read-only
//! - **Context**: [`StageContext`], the config plus the external services
//! - **Stages**: the [`Stage`] implementations in [`stages`]
//! - **Orchestrator**: [`PipelineOrchestrator`], which schedules creators
//!
//! # Pipeline Flow
//!
//! 1. **Fetch**: all creators are read once and ordered by audience size
//! 2. **Prompt**: the prompt service produces an outreach bundle; its magnets
//!    are upserted and the outreach message is written to the creator
//! 3. **Render**: one image per magnet, retried on transient failures
//! 4. **Compose**: the first three rendered magnets become a cover scene
//!
//! Every stage result is cached per creator. A creator whose stage fails is
//! marked `failed` and the batch moves on.
//!
//! # Example
//!
//! ```rust,ignore
//! use outreach_forge::pipeline::{
//!     ExecutionMode, PipelineConfig, PipelineOrchestrator, RunOptions, StageContext,
//! };
//!
//! let config = PipelineConfig::from_env()?;
//! let orchestrator = PipelineOrchestrator::new(StageContext::from_config(config));
//!
//! let summary = orchestrator
//!     .run(RunOptions::new().with_mode(ExecutionMode::Concurrent))
//!     .await?;
//! println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
//! ```

pub mod cleanup;
pub mod config;
pub mod context;
pub mod orchestrator;
pub mod ordering;
pub mod stage;
pub mod stages;

// Re-export main types for convenience
pub use cleanup::{reset_failed, CleanupReport};
pub use config::{ConfigError, PipelineConfig};
pub use context::{CreatorState, StageContext};
pub use orchestrator::{
    BatchSummary, CreatorOutcome, ExecutionMode, PipelineOrchestrator, RunOptions, StepSelection,
};
pub use ordering::EntityOrderer;
pub use stage::{Stage, StageId, StageRun};
