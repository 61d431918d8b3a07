//! outreach-forge: outreach asset generation for newsletter creators.
//!
//! This library fetches creators from a REST table store, generates an
//! outreach bundle for each one, renders its magnets and composes a cover
//! scene, caching every stage result per creator.

// Core modules
pub mod cache;
pub mod cli;
pub mod error;
pub mod generation;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod utils;

// Re-export commonly used error types
pub use error::{GenerationError, PipelineError, StageError, StoreError};
