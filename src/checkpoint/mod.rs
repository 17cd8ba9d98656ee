//! Checkpoint module for resumable pipeline execution.
//!
//! Provides:
//! - `CheckpointStore`: topic-scoped, stage-keyed record of completed work
//! - `ProgressView`: read-only progress snapshots for concurrent observers

mod progress;
mod store;

pub use progress::*;
pub use store::*;
