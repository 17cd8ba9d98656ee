//! Stage identity and the fixed stage sequence.
//!
//! Stages are identified by an explicit `StageId` handed to the executor
//! alongside the request. Nothing in the crate infers a stage from prompt text.

use crate::models::{CrewError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Identity of one stage in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for StageId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Ordered, immutable sequence of stages.
///
/// Later stages consume the sanitized output of the stage before them, so
/// position in the sequence is the only ordering the pipeline knows about.
/// Cloning is cheap; the sequence is shared between the runner and any
/// progress views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSequence {
    stages: Arc<[StageId]>,
}

impl StageSequence {
    /// Build a sequence, rejecting empty, blank or duplicated stage names.
    pub fn new<I, S>(stages: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<StageId>,
    {
        let stages: Vec<StageId> = stages.into_iter().map(Into::into).collect();
        if stages.is_empty() {
            return Err(CrewError::InvalidInput(
                "stage sequence must contain at least one stage".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(stages.len());
        for stage in &stages {
            if stage.as_str().trim().is_empty() {
                return Err(CrewError::InvalidInput("stage name must not be blank".to_string()));
            }
            if !seen.insert(stage.as_str()) {
                return Err(CrewError::InvalidInput(format!("duplicate stage: {stage}")));
            }
        }

        Ok(Self {
            stages: stages.into(),
        })
    }

    /// The research → draft → edit sequence.
    pub fn plan_write_edit() -> Self {
        Self {
            stages: vec![
                StageId::new("plan"),
                StageId::new("write"),
                StageId::new("edit"),
            ]
            .into(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StageId> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Final stage; its output is the run result.
    pub fn last(&self) -> &StageId {
        // Non-empty by construction.
        &self.stages[self.stages.len() - 1]
    }

    pub fn position(&self, stage: &StageId) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }
}

impl Default for StageSequence {
    fn default() -> Self {
        Self::plan_write_edit()
    }
}

impl<'a> IntoIterator for &'a StageSequence {
    type Item = &'a StageId;
    type IntoIter = std::slice::Iter<'a, StageId>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_preserves_order() {
        let seq = StageSequence::new(["plan", "write", "edit"]).unwrap();
        let names: Vec<&str> = seq.iter().map(StageId::as_str).collect();
        assert_eq!(names, vec!["plan", "write", "edit"]);
        assert_eq!(seq.last().as_str(), "edit");
        assert_eq!(seq.position(&StageId::from("write")), Some(1));
        assert_eq!(seq, StageSequence::default());
    }

    #[test]
    fn test_sequence_rejects_empty_and_duplicates() {
        assert!(StageSequence::new(Vec::<String>::new()).is_err());
        assert!(StageSequence::new(["plan", "plan"]).is_err());
        assert!(StageSequence::new(["plan", "  "]).is_err());
    }
}
