//! CLI command definitions for outreach-forge.
//!
//! This module provides the command-line interface for running the outreach
//! pipeline and maintaining its cache and creator statuses.

use crate::cache::CacheKey;
use crate::pipeline::{
    reset_failed, ExecutionMode, PipelineConfig, PipelineOrchestrator, RunOptions, StageContext,
    StageId, StepSelection,
};
use clap::Parser;
use tracing::info;

/// Outreach asset generator for newsletter creators.
#[derive(Parser)]
#[command(name = "outreach-forge")]
#[command(about = "Generate outreach messages, magnet renders and cover scenes for creators")]
#[command(version)]
#[command(
    long_about = "outreach-forge fetches creators, generates an outreach bundle for each one, renders its magnets and composes a cover scene.\n\nSettings are read from the environment (and an optional .env file).\n\nExample usage:\n  outreach-forge run --steps 2,3,4 --creator-id 12345"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Cache directory (overrides OUTREACH_CACHE_DIR).
    #[arg(long, global = true)]
    pub cache_dir: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the pipeline over all creators, or one.
    Run(RunArgs),

    /// Move failed creators back to pending and drop their render/compose cache.
    #[command(name = "reset-failed")]
    ResetFailed,

    /// Inspect or clear the result cache.
    Cache(CacheArgs),
}

/// Arguments for `outreach-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Comma-separated stages to run (1=fetch, 2=prompt, 3=render, 4=compose).
    #[arg(short, long, default_value = "1,2,3,4")]
    pub steps: String,

    /// Only process the creator with this creator_id (or id).
    #[arg(short = 'c', long)]
    pub creator_id: Option<String>,

    /// Process creators concurrently instead of one at a time.
    #[arg(long)]
    pub concurrent: bool,

    /// Creators processed at once in concurrent mode (overrides OUTREACH_CONCURRENCY).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Ignore cached stage results and do not write new ones.
    #[arg(long)]
    pub no_cache: bool,
}

/// Arguments for `outreach-forge cache`.
#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheSubcommand,
}

/// Cache subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum CacheSubcommand {
    /// Remove cache records. Without filters every record is removed.
    Clear {
        /// Only this creator's records.
        #[arg(short = 'c', long)]
        creator_id: Option<String>,
        /// Only this stage (1-4, step_one.., or fetch/prompt/render/compose).
        #[arg(long)]
        stage: Option<StageId>,
    },
    /// Print one cache record, or list the stored keys.
    Show {
        #[arg(short = 'c', long)]
        creator_id: Option<String>,
        #[arg(long)]
        stage: Option<StageId>,
    },
}

/// Parse CLI arguments and return the Cli struct.
/// This allows main.rs to access global options like log_level before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(dir) = cli.cache_dir {
        config = config.with_cache_dir(dir);
    }

    match cli.command {
        Commands::Run(args) => run_pipeline_command(config, args).await,
        Commands::ResetFailed => run_reset_failed_command(config).await,
        Commands::Cache(args) => run_cache_command(config, args).await,
    }
}

async fn run_pipeline_command(mut config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    let steps = StepSelection::parse(&args.steps)?;
    if args.no_cache {
        config = config.with_cache(false);
    }
    if let Some(n) = args.concurrency {
        config = config.with_max_concurrent_creators(n);
    }
    config.validate()?;

    let mode = if args.concurrent {
        ExecutionMode::Concurrent
    } else {
        ExecutionMode::Sequential
    };
    let mut options = RunOptions::new().with_steps(steps).with_mode(mode);
    if let Some(id) = args.creator_id {
        options = options.with_creator_id(id);
    }

    let orchestrator = PipelineOrchestrator::new(StageContext::from_config(config));
    let summary = orchestrator.run(options).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_reset_failed_command(config: PipelineConfig) -> anyhow::Result<()> {
    let ctx = StageContext::from_config(config);
    let report = reset_failed(&ctx).await?;
    info!(
        found = report.found,
        reset = report.reset.len(),
        "Reset failed creators"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_cache_command(config: PipelineConfig, args: CacheArgs) -> anyhow::Result<()> {
    let ctx = StageContext::new(config);

    match args.command {
        CacheSubcommand::Clear { creator_id, stage } => {
            let removed = ctx.cache.clear(creator_id.as_deref(), stage).await;
            println!("Removed {} cache record(s)", removed);
        }
        CacheSubcommand::Show {
            creator_id: Some(id),
            stage: Some(stage),
        } => {
            let key = if stage == StageId::Fetch {
                CacheKey::all_creators()
            } else {
                CacheKey::new(id, stage)
            };
            let record = ctx
                .cache
                .load_raw(&key)
                .await
                .ok_or_else(|| anyhow::anyhow!("No cache record for {}", key))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        CacheSubcommand::Show { creator_id, stage } => {
            let keys = ctx.cache.keys(creator_id.as_deref(), stage).await;
            if keys.is_empty() {
                println!("No cache records");
            }
            for key in keys {
                println!("{}", key);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["outreach-forge", "run"]).expect("should parse");
        assert_eq!(cli.log_level, "info");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.steps, "1,2,3,4");
                assert!(args.creator_id.is_none());
                assert!(!args.concurrent);
                assert!(!args.no_cache);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = Cli::try_parse_from([
            "outreach-forge",
            "run",
            "--steps",
            "3,4",
            "-c",
            "42",
            "--concurrent",
            "--concurrency",
            "5",
            "--no-cache",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.steps, "3,4");
                assert_eq!(args.creator_id.as_deref(), Some("42"));
                assert!(args.concurrent);
                assert_eq!(args.concurrency, Some(5));
                assert!(args.no_cache);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cache_subcommands() {
        let cli = Cli::try_parse_from([
            "outreach-forge",
            "cache",
            "clear",
            "--creator-id",
            "7",
            "--stage",
            "render",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Cache(CacheArgs {
                command: CacheSubcommand::Clear { creator_id, stage },
            }) => {
                assert_eq!(creator_id.as_deref(), Some("7"));
                assert_eq!(stage, Some(StageId::Render));
            }
            _ => panic!("Expected cache clear"),
        }

        assert!(Cli::try_parse_from(["outreach-forge", "cache", "show", "--stage", "9"]).is_err());
    }

    #[test]
    fn test_reset_failed_parses() {
        let cli = Cli::try_parse_from(["outreach-forge", "reset-failed"]).expect("should parse");
        assert!(matches!(cli.command, Commands::ResetFailed));
    }
}
