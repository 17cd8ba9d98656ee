//! Read-only progress view over the checkpoint store.
//!
//! A `ProgressView` can be polled from any task while a run is writing
//! checkpoints. It only ever takes the store's read lock, once per snapshot.

use crate::checkpoint::CheckpointStore;
use crate::models::{StageId, StageSequence};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Completion state of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StageStatus {
    Completed {
        producer_label: String,
        completed_at: DateTime<Utc>,
    },
    Pending,
}

/// Progress entry for one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageProgress {
    pub stage: StageId,
    pub index: usize,
    #[serde(flatten)]
    pub status: StageStatus,
}

impl StageProgress {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, StageStatus::Completed { .. })
    }
}

/// Point-in-time view of a topic's progress.
///
/// Without an active topic the snapshot has `topic: None` and every stage
/// pending; reading progress before a run starts is not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub topic: Option<String>,
    pub stages: Vec<StageProgress>,
    /// First stage in sequence order without a checkpoint
    pub next_pending: Option<StageId>,
}

impl ProgressSnapshot {
    pub fn completed(&self) -> usize {
        self.stages.iter().filter(|s| s.is_completed()).count()
    }

    pub fn total(&self) -> usize {
        self.stages.len()
    }

    pub fn is_complete(&self) -> bool {
        self.next_pending.is_none()
    }

    /// Get progress percentage.
    pub fn progress_percent(&self) -> f64 {
        if self.stages.is_empty() {
            return 100.0;
        }
        (self.completed() as f64 / self.total() as f64) * 100.0
    }
}

/// Something that can report pipeline progress at any time.
pub trait ProgressObserver: Send + Sync {
    /// Progress of the active topic.
    fn snapshot(&self) -> ProgressSnapshot;
}

/// Progress observer backed by a shared `CheckpointStore`.
#[derive(Debug, Clone)]
pub struct ProgressView {
    store: Arc<CheckpointStore>,
    stages: StageSequence,
}

impl ProgressView {
    pub fn new(store: Arc<CheckpointStore>, stages: StageSequence) -> Self {
        Self { store, stages }
    }

    /// Progress of a specific topic, independent of the active scope.
    pub fn snapshot_for(&self, topic: &str) -> ProgressSnapshot {
        self.build(Some(topic))
    }

    fn build(&self, topic: Option<&str>) -> ProgressSnapshot {
        let (topic, entries) = self.store.scoped_entries(topic);

        let stages: Vec<StageProgress> = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                let status = match entries.get(stage) {
                    Some(cp) if cp.done => StageStatus::Completed {
                        producer_label: cp.producer_label.clone(),
                        completed_at: cp.completed_at,
                    },
                    _ => StageStatus::Pending,
                };
                StageProgress {
                    stage: stage.clone(),
                    index,
                    status,
                }
            })
            .collect();

        let next_pending = stages
            .iter()
            .find(|s| !s.is_completed())
            .map(|s| s.stage.clone());

        ProgressSnapshot {
            topic,
            stages,
            next_pending,
        }
    }
}

impl ProgressObserver for ProgressView {
    fn snapshot(&self) -> ProgressSnapshot {
        self.build(None)
    }
}
