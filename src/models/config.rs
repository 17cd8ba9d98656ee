//! Configuration models for stagecrew.
//!
//! Everything the pipeline leaves to the operator (provider endpoint, retry
//! budget, request pacing, the stage list) is parameterized here and loaded
//! from a TOML file.

use crate::models::{StageId, StageSequence};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Upper bound for any configured delay (one day).
pub const MAX_DELAY_SECS: f64 = 86_400.0;

/// Top-level configuration for stagecrew.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// LLM provider endpoint (OpenAI-compatible)
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Pipeline-level retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Request pacing
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Stages in execution order
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// Provider endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name, used for logging, producer labels and credential lookup
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Base URL of the chat completions API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key (may contain ${ENV_VAR} placeholders)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Client-level retries for transport errors (never for 429s)
    #[serde(default = "default_network_retries")]
    pub network_retries: u32,
}

fn default_provider_name() -> String {
    "cerebras".to_string()
}

fn default_base_url() -> String {
    "https://api.cerebras.ai/v1".to_string()
}

fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}

fn default_timeout() -> u64 {
    180
}

fn default_network_retries() -> u32 {
    3
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_base_url(),
            api_key: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout(),
            network_retries: default_network_retries(),
        }
    }
}

/// Bounded exponential backoff around a whole pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of run attempts (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_min_wait")]
    pub min_wait_secs: f64,

    /// Upper bound for any single delay
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: f64,

    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Sleep before every attempt, including the first
    #[serde(default)]
    pub pacing_delay_secs: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_min_wait() -> f64 {
    4.0
}

fn default_max_wait() -> f64 {
    120.0
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_wait_secs: default_min_wait(),
            max_wait_secs: default_max_wait(),
            multiplier: default_multiplier(),
            pacing_delay_secs: 0.0,
        }
    }
}

/// Proactive request throttling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per minute per model (0 disables throttling)
    #[serde(default)]
    pub max_rpm: u32,
}

/// One pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage identity (e.g. "plan")
    pub name: String,

    /// Model ID at the provider
    pub model: String,

    /// Producer label recorded in checkpoints (defaults to the stage name)
    #[serde(default)]
    pub label: Option<String>,

    /// Path to the system prompt file
    #[serde(default)]
    pub system_prompt: Option<PathBuf>,

    /// User prompt template; `{key}` placeholders are filled from run inputs
    #[serde(default = "default_prompt")]
    pub prompt: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_prompt() -> String {
    "{topic}".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f64 {
    0.7
}

impl StageConfig {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[stages]] entry is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(ConfigError::Invalid("stage name must not be empty".to_string()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".to_string()));
        }
        if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1".to_string()));
        }
        let delays = [retry.min_wait_secs, retry.max_wait_secs, retry.pacing_delay_secs];
        if delays.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(ConfigError::Invalid(
                "retry delays must be finite and non-negative".to_string(),
            ));
        }
        if delays.iter().any(|d| *d > MAX_DELAY_SECS) {
            return Err(ConfigError::Invalid(format!(
                "retry delays must not exceed {MAX_DELAY_SECS} seconds"
            )));
        }
        if retry.min_wait_secs > retry.max_wait_secs {
            return Err(ConfigError::Invalid(
                "retry.min_wait_secs must not exceed retry.max_wait_secs".to_string(),
            ));
        }

        Ok(())
    }

    /// Stage sequence in configured order.
    pub fn stage_sequence(&self) -> Result<StageSequence, ConfigError> {
        StageSequence::new(self.stages.iter().map(|s| StageId::new(s.name.clone())))
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Resolve the provider API key from config or environment.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.provider.api_key {
            return Ok(expand_env_vars(key));
        }

        std::env::var(&self.provider.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            provider: self.provider.name.clone(),
            env_var: self.provider.api_key_env.clone(),
        })
    }
}

/// Convert seconds to a `Duration`, saturating instead of panicking.
///
/// NaN and negative values become zero; values too large for a `Duration`
/// (including infinity) become `Duration::MAX`.
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    ENV_VAR
        .replace_all(s, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(
        "Missing API key for provider '{provider}': set {env_var} env var or api_key in config"
    )]
    MissingApiKey { provider: String, env_var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
