//! stagecrew - Resumable multi-stage LLM content pipeline.
//!
//! ## Architecture
//!
//! A topic flows through a fixed sequence of stages (by default
//! `plan → write → edit`). Each stage's sanitized output is checkpointed
//! before the next stage starts, and becomes that stage's context.
//!
//! - **CheckpointStore**: topic-scoped record of completed stages
//! - **PipelineRunner**: skips checkpointed stages, runs the rest in order
//! - **RetryPolicy**: re-runs the whole pipeline on rate limits; every retry
//!   resumes from the checkpoints the failed attempt left behind
//! - **ProgressView**: read-only snapshot of the active topic, safe to poll
//!   while a run is in flight
//!
//! Stage work is behind the [`StageExecutor`] trait. [`ChatStageExecutor`]
//! implements it over any OpenAI-compatible chat-completions endpoint.

pub mod checkpoint;
pub mod client;
pub mod executor;
pub mod models;
pub mod pipeline;
pub mod sanitize;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, CheckpointStore, ProgressObserver, ProgressSnapshot, ProgressView};
pub use client::{LLMClient, RateLimiter};
pub use executor::{ChatStageExecutor, Credentials, StageExecutor, StageOutput, StageRequest};
pub use models::{Config, CrewError, Result, StageError, StageId, StageSequence};
pub use pipeline::{CancelToken, PipelineRun, PipelineRunner, RetryPolicy, RunOutcome};
pub use sanitize::sanitize;
