//! Error types for stagecrew.
//!
//! Two layers:
//! - `StageError`: what a stage executor reports, classified so the retry
//!   policy can tell a rate limit apart from everything else
//! - `CrewError`: what the crate returns to callers

use crate::models::{secs_to_duration, StageId};
use std::time::Duration;
use thiserror::Error;

/// Classified failure of a single stage execution.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    // ═══════════════════════════════════════════════════════════════════
    // Retriable: back off and re-enter the run
    // ═══════════════════════════════════════════════════════════════════

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<f64>,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Fatal: abort the run, keep committed checkpoints
    // ═══════════════════════════════════════════════════════════════════

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Provider error (status {status}): {message}")]
    Provider { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stage failed: {0}")]
    Failed(String),
}

impl StageError {
    /// Convenience constructor for a rate limit without a retry hint.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Only rate limits are retried; every other kind is fatal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Provider supplied retry delay, if any.
    ///
    /// Hints too large for a `Duration` saturate; callers cap them.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } if !secs.is_nan() && *secs >= 0.0 => Some(secs_to_duration(*secs)),
            _ => None,
        }
    }
}

/// Top-level error type for stagecrew.
#[derive(Debug, Error)]
pub enum CrewError {
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: StageId,
        #[source]
        source: StageError,
    },

    #[error("Run cancelled{}", cancelled_suffix(.stage))]
    Cancelled { stage: Option<StageId> },

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CrewError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn stage(stage: StageId, source: StageError) -> Self {
        Self::Stage { stage, source }
    }

    /// True when the failure is a rate limit the retry policy may absorb.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Stage { source, .. } if source.is_rate_limited())
    }

    /// Retry hint carried by a rate-limited stage error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Stage { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// Stage the error is attributed to, if any.
    pub fn failed_stage(&self) -> Option<&StageId> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            Self::Cancelled { stage } => stage.as_ref(),
            _ => None,
        }
    }
}

fn cancelled_suffix(stage: &Option<StageId>) -> String {
    match stage {
        Some(stage) => format!(" before stage '{stage}'"),
        None => String::new(),
    }
}

/// Result type alias for stagecrew.
pub type Result<T> = std::result::Result<T, CrewError>;
