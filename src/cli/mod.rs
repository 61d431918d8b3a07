//! Command-line interface for outreach-forge.
//!
//! Provides commands for running the pipeline, resetting failed creators,
//! and inspecting or clearing the result cache.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
