//! Error types for outreach-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Entity store access (Supabase REST)
//! - Prompt and image generation services
//! - Individual pipeline stages
//! - Whole-batch pipeline runs

use thiserror::Error;

use crate::pipeline::StageId;

/// Errors that can occur while talking to the entity store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Missing store credentials: SUPABASE_URL and SUPABASE_API_KEY must both be set")]
    MissingCredentials,

    #[error("Store request failed: {0}")]
    Request(String),

    #[error("Store returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Uniqueness conflict on {table}: {body}")]
    Conflict { table: String, body: String },

    #[error("Failed to decode store response: {0}")]
    Decode(String),
}

impl StoreError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Request(_) => true,
            StoreError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Errors that can occur during prompt or image generation calls.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Missing generation service configuration: {0}")]
    MissingConfig(&'static str),

    #[error("Generation request failed: {0}")]
    Request(String),

    #[error("Generation service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Generation service returned an empty response")]
    EmptyResponse,

    #[error("Generation service returned an empty URL list")]
    EmptyResult,

    #[error("Failed to parse generation response: {0}")]
    Parse(String),

    #[error("Generation response is missing required field '{0}'")]
    MissingField(&'static str),
}

impl GenerationError {
    /// Any failure of a configured service is retried, whatever its status
    /// code; only a missing configuration is final.
    pub fn is_transient(&self) -> bool {
        !matches!(self, GenerationError::MissingConfig(_))
    }
}

/// Errors that halt one creator's progress through one stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage} validation failed: {reason}")]
    Validation { stage: StageId, reason: String },

    #[error("{stage} gave up after {attempts} attempts: {last}")]
    Exhausted {
        stage: StageId,
        attempts: u32,
        last: String,
    },

    #[error("{stage} failed permanently on attempt {attempt}: {reason}")]
    Rejected {
        stage: StageId,
        attempt: u32,
        reason: String,
    },

    #[error("{stage} produced no successful output for creator {creator_id}")]
    NoSuccess { stage: StageId, creator_id: String },

    #[error("{stage} cache record not found for creator {creator_id}; run that stage first")]
    MissingCache { stage: StageId, creator_id: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),
}

impl StageError {
    pub fn validation(stage: StageId, reason: impl Into<String>) -> Self {
        StageError::Validation {
            stage,
            reason: reason.into(),
        }
    }
}

/// Structural errors that abort a whole batch before any creator is processed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::pipeline::ConfigError),

    #[error("Fetching creators failed: {0}")]
    Fetch(#[source] StageError),

    #[error("No creators found")]
    NoCreators,

    #[error("Creator '{0}' not found")]
    CreatorNotFound(String),

    #[error("Required cache records are missing: {0}")]
    MissingCache(String),

    #[error("Invalid step selection '{0}': expected a comma-separated subset of 1,2,3,4")]
    InvalidSteps(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_transient() {
        assert!(StoreError::Request("timeout".into()).is_transient());
        assert!(StoreError::Http {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!StoreError::Http {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!StoreError::MissingCredentials.is_transient());
    }

    #[test]
    fn test_generation_error_transient() {
        assert!(GenerationError::EmptyResult.is_transient());
        assert!(GenerationError::Http {
            status: 429,
            body: "slow down".into()
        }
        .is_transient());
        assert!(GenerationError::Http {
            status: 400,
            body: "bad request".into()
        }
        .is_transient());
        assert!(GenerationError::Parse("bad".into()).is_transient());
        assert!(GenerationError::Request("timeout".into()).is_transient());
        assert!(!GenerationError::MissingConfig("IMAGE_API_URL").is_transient());
    }

    #[test]
    fn test_stage_error_display() {
        let err = StageError::validation(StageId::Compose, "only 2 rendered magnets");
        assert!(err.to_string().contains("step_four"));
        assert!(err.to_string().contains("only 2"));

        let err = StageError::Exhausted {
            stage: StageId::Render,
            attempts: 4,
            last: "empty".into(),
        };
        assert!(err.to_string().contains("4 attempts"));

        let err = StageError::Rejected {
            stage: StageId::Render,
            attempt: 1,
            reason: "not configured".into(),
        };
        assert!(err.to_string().contains("failed permanently on attempt 1"));
        assert!(!err.to_string().contains("gave up"));
    }

    #[test]
    fn test_pipeline_error_display() {
        let err = PipelineError::InvalidSteps("5".into());
        assert!(err.to_string().contains("'5'"));
        assert!(PipelineError::NoCreators.to_string().contains("No creators"));
    }
}
