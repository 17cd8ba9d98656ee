//! Stage executor contract.
//!
//! The pipeline does not know how a stage does its work. It hands a
//! `StageExecutor` the stage identity plus the input context and expects raw
//! text back, or a `StageError` classified as rate-limited or fatal.

mod chat;

pub use chat::*;

use crate::models::{StageError, StageId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Everything an executor needs to run one stage.
#[derive(Debug, Clone, Copy)]
pub struct StageRequest<'a> {
    /// Topic the run is scoped to
    pub topic: &'a str,
    /// Stage to execute
    pub stage: &'a StageId,
    /// Position of the stage in the sequence
    pub index: usize,
    /// Caller-supplied run inputs (always includes "topic")
    pub inputs: &'a HashMap<String, String>,
    /// Sanitized output of the previous stage; `None` for the first stage
    pub context: Option<&'a str>,
    /// Provider credentials for this run
    pub credentials: &'a Credentials,
}

/// Raw result of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    /// Unsanitized output text
    pub text: String,
    /// Who produced it, recorded in the checkpoint
    pub producer_label: String,
}

impl StageOutput {
    pub fn new(text: impl Into<String>, producer_label: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            producer_label: producer_label.into(),
        }
    }
}

/// Performs the work of a single stage.
pub trait StageExecutor: Send + Sync {
    fn execute(
        &self,
        request: StageRequest<'_>,
    ) -> impl Future<Output = Result<StageOutput, StageError>> + Send;
}

impl<E: StageExecutor> StageExecutor for Arc<E> {
    fn execute(
        &self,
        request: StageRequest<'_>,
    ) -> impl Future<Output = Result<StageOutput, StageError>> + Send {
        (**self).execute(request)
    }
}

/// Provider secrets keyed by provider name.
///
/// Passed per run and never logged.
#[derive(Clone, Default)]
pub struct Credentials {
    secrets: HashMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the secret for `provider`.
    pub fn with(mut self, provider: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets.insert(provider.into(), secret.into());
        self
    }

    pub fn get(&self, provider: &str) -> Option<&str> {
        self.secrets.get(provider).map(String::as_str)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<&str> = self.secrets.keys().map(String::as_str).collect();
        providers.sort_unstable();
        f.debug_struct("Credentials")
            .field("providers", &providers)
            .finish_non_exhaustive()
    }
}
