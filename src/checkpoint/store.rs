//! In-memory checkpoint store for resumable pipeline runs.
//!
//! Checkpoints are partitioned by topic and keyed by stage. The store is the
//! only state shared between a running pipeline and whoever polls its
//! progress, so every operation takes the single store lock exactly once:
//! readers see a checkpoint either fully written or not at all.
//!
//! Nothing is persisted; the store lives as long as the process.

use crate::models::{StageId, StageSequence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Completed work for one (topic, stage) pair.
///
/// Immutable once created. Re-running a stage swaps in a new `Arc` so readers
/// holding the old one keep a consistent value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stage this checkpoint completes
    pub stage: StageId,
    /// Sanitized stage output
    pub output: String,
    /// Which executor produced the output (display only)
    pub producer_label: String,
    /// When the stage completed
    pub completed_at: DateTime<Utc>,
    /// Always true; checkpoints are never created partially
    pub done: bool,
}

type StageMap = HashMap<StageId, Arc<Checkpoint>>;

#[derive(Debug, Default)]
struct StoreInner {
    topics: HashMap<String, StageMap>,
    active_topic: Option<String>,
}

/// Topic-scoped, stage-keyed record of completed work.
///
/// Construct one per process (or per test) and share it behind an `Arc`.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    inner: RwLock<StoreInner>,
}

impl CheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // Every mutation is a single map operation, so a panic elsewhere cannot
    // leave the maps half-updated; a poisoned lock is safe to reuse.
    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `topic` the scope for unscoped reads. Idempotent.
    pub fn set_active_topic(&self, topic: &str) {
        let mut inner = self.write();
        inner.topics.entry(topic.to_string()).or_default();
        if inner.active_topic.as_deref() != Some(topic) {
            debug!(topic = %topic, "Active topic set");
            inner.active_topic = Some(topic.to_string());
        }
    }

    /// Currently active topic, if any.
    pub fn active_topic(&self) -> Option<String> {
        self.read().active_topic.clone()
    }

    /// Insert or replace the checkpoint for (topic, stage).
    pub fn save(
        &self,
        topic: &str,
        stage: &StageId,
        output: impl Into<String>,
        producer_label: impl Into<String>,
    ) -> Arc<Checkpoint> {
        let checkpoint = Arc::new(Checkpoint {
            stage: stage.clone(),
            output: output.into(),
            producer_label: producer_label.into(),
            completed_at: Utc::now(),
            done: true,
        });

        self.write()
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(stage.clone(), Arc::clone(&checkpoint));

        debug!(
            topic = %topic,
            stage = %stage,
            producer = %checkpoint.producer_label,
            bytes = checkpoint.output.len(),
            "Checkpoint saved"
        );
        checkpoint
    }

    /// True only if a completed checkpoint exists for (topic, stage).
    pub fn has(&self, topic: &str, stage: &StageId) -> bool {
        self.read()
            .topics
            .get(topic)
            .and_then(|stages| stages.get(stage))
            .is_some_and(|cp| cp.done)
    }

    /// Checkpoint for (topic, stage), if present.
    pub fn get(&self, topic: &str, stage: &StageId) -> Option<Arc<Checkpoint>> {
        self.read()
            .topics
            .get(topic)
            .and_then(|stages| stages.get(stage))
            .cloned()
    }

    /// Remove every checkpoint of one topic. Other topics are untouched.
    ///
    /// Returns the number of checkpoints removed; clearing an unknown topic
    /// is a no-op.
    pub fn clear(&self, topic: &str) -> usize {
        let removed = self
            .write()
            .topics
            .get_mut(topic)
            .map(|stages| {
                let n = stages.len();
                stages.clear();
                n
            })
            .unwrap_or(0);

        if removed > 0 {
            info!(topic = %topic, removed, "Checkpoints cleared");
        } else {
            debug!(topic = %topic, "No checkpoints to clear");
        }
        removed
    }

    /// Remove every topic's checkpoints and reset the active topic.
    pub fn clear_all(&self) {
        let mut inner = self.write();
        inner.topics.clear();
        inner.active_topic = None;
        info!("All checkpoints cleared");
    }

    /// Highest-index stage of `sequence` with a completed checkpoint.
    ///
    /// Stages run strictly in order, so every earlier stage is presumed
    /// complete as well. For observers and display; the runner's cache
    /// check uses the stricter [`CheckpointStore::is_complete`].
    pub fn latest_completed_stage(&self, topic: &str, sequence: &StageSequence) -> Option<StageId> {
        let inner = self.read();
        let stages = inner.topics.get(topic)?;
        sequence
            .iter()
            .rev()
            .find(|stage| stages.get(*stage).is_some_and(|cp| cp.done))
            .cloned()
    }

    /// True when every stage of `sequence` is checkpointed for `topic`.
    pub fn is_complete(&self, topic: &str, sequence: &StageSequence) -> bool {
        let inner = self.read();
        inner.topics.get(topic).is_some_and(|stages| {
            sequence
                .iter()
                .all(|stage| stages.get(stage).is_some_and(|cp| cp.done))
        })
    }

    /// Checkpoints of `topic` in sequence order (missing stages skipped).
    pub fn checkpoints(&self, topic: &str, sequence: &StageSequence) -> Vec<Arc<Checkpoint>> {
        let inner = self.read();
        let Some(stages) = inner.topics.get(topic) else {
            return Vec::new();
        };
        sequence
            .iter()
            .filter_map(|stage| stages.get(stage).cloned())
            .collect()
    }

    /// Known topic keys, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.read().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Consistent copy of one topic's checkpoints, taken under a single lock.
    ///
    /// `None` selects the active topic. Returns the resolved topic (if any)
    /// with its entries.
    pub(crate) fn scoped_entries(&self, topic: Option<&str>) -> (Option<String>, StageMap) {
        let inner = self.read();
        let topic = match topic {
            Some(t) => Some(t.to_string()),
            None => inner.active_topic.clone(),
        };
        let entries = topic
            .as_deref()
            .and_then(|t| inner.topics.get(t))
            .cloned()
            .unwrap_or_default();
        (topic, entries)
    }
}
