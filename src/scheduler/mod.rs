//! Bounded concurrency for the pipeline.
//!
//! [`WorkerPool`] is the single concurrency primitive of the crate. The
//! orchestrator uses one pool to run whole-creator pipelines side by side,
//! and stages use a second pool to fan out external calls within one
//! creator. Separate pools keep an outer job from waiting on permits its
//! own inner jobs need.
//!
//! ```text
//!        ┌──────────────┐
//!        │ Orchestrator │
//!        └──────┬───────┘
//!               │ creator pool (OUTREACH_CONCURRENCY)
//!     ┌─────────┼─────────┐
//!     ▼         ▼         ▼
//! ┌────────┐┌────────┐┌────────┐
//! │creator ││creator ││creator │
//! └───┬────┘└───┬────┘└───┬────┘
//!     │ call pool (OUTREACH_FANOUT)
//!     ▼
//!  render / upsert calls
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use outreach_forge::scheduler::WorkerPool;
//!
//! let pool = WorkerPool::new("creators", 3);
//! let results = pool.run_all(creators, |creator| run_one(creator)).await;
//! ```

pub mod worker_pool;

pub use worker_pool::{PoolError, PoolStats, WorkerPool};
