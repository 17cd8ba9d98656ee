//! Chat-completions client for OpenAI-compatible providers.
//!
//! Groq, Cerebras, OpenAI and most aggregators speak the same
//! `/chat/completions` schema. The client:
//! - retries transport failures with exponential backoff
//! - never retries a 429; it reports `StageError::RateLimited` so the
//!   pipeline retry policy can resume the run from its checkpoints
//! - paces requests through a shared `RateLimiter`

use crate::client::RateLimiter;
use crate::models::{CrewError, ProviderConfig, Result, StageError};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

const MAX_ERROR_BODY_CHARS: usize = 500;

/// Message in a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f64,
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// One chat completion call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// Response from a completion request.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Generated content
    pub content: String,
    /// Model used (may differ from requested)
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Request duration
    pub duration: Duration,
}

/// Client for one OpenAI-compatible endpoint.
pub struct LLMClient {
    client: reqwest::Client,
    /// Provider name (for logging)
    name: String,
    base_url: String,
    timeout: Duration,
    /// Attempts for transport failures
    max_retries: u32,
    rate_limiter: Arc<RateLimiter>,
    total_input_tokens: AtomicU64,
    total_output_tokens: AtomicU64,
}

impl LLMClient {
    /// Create a new client.
    pub fn new(
        name: String,
        base_url: String,
        timeout_secs: u64,
        max_retries: u32,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CrewError::Network)?;

        Ok(Self {
            client,
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            max_retries: max_retries.max(1),
            rate_limiter,
            total_input_tokens: AtomicU64::new(0),
            total_output_tokens: AtomicU64::new(0),
        })
    }

    /// Create a client from the `[provider]` config section.
    pub fn from_config(provider: &ProviderConfig, rate_limiter: Arc<RateLimiter>) -> Result<Self> {
        Self::new(
            provider.name.clone(),
            provider.base_url.clone(),
            provider.timeout_secs,
            provider.network_retries,
            rate_limiter,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    fn headers(&self, api_key: Option<&str>) -> std::result::Result<HeaderMap, StageError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
                StageError::Authentication("API key contains invalid header characters".to_string())
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Complete a chat request.
    pub async fn complete(
        &self,
        api_key: Option<&str>,
        request: &ChatRequest,
    ) -> std::result::Result<CompletionResponse, StageError> {
        let start = Instant::now();
        let url = format!("{}/chat/completions", self.base_url);
        let headers = self.headers(api_key)?;
        let payload = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let mut attempt = 0;
        let response = loop {
            self.rate_limiter.acquire(&request.model).await;

            match self
                .client
                .post(&url)
                .headers(headers.clone())
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => break response,
                Err(e) => {
                    attempt += 1;
                    let error = if e.is_timeout() {
                        StageError::Timeout(self.timeout)
                    } else {
                        StageError::Network(e.to_string())
                    };
                    if attempt >= self.max_retries {
                        return Err(error);
                    }
                    let backoff = Duration::from_secs(2u64.pow(attempt - 1));
                    debug!(
                        provider = %self.name,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %error,
                        "Retrying after network error"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let error = classify_failure(status, retry_after, &body);
            if error.is_rate_limited() {
                self.rate_limiter
                    .record_429(&request.model, error.retry_after());
            }
            return Err(error);
        }
        self.rate_limiter.record_success(&request.model);

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| StageError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| StageError::InvalidResponse("No content in response".to_string()))?;

        let usage = body.usage.unwrap_or_default();
        self.total_input_tokens
            .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
        self.total_output_tokens
            .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);

        Ok(CompletionResponse {
            content,
            model: body.model.unwrap_or_else(|| request.model.clone()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            duration: start.elapsed(),
        })
    }

    /// Get total tokens tracked (input, output).
    pub fn total_tokens(&self) -> (u64, u64) {
        (
            self.total_input_tokens.load(Ordering::Relaxed),
            self.total_output_tokens.load(Ordering::Relaxed),
        )
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<f64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
}

/// Map a non-success HTTP status to a classified stage error.
pub(crate) fn classify_failure(status: u16, retry_after_secs: Option<f64>, body: &str) -> StageError {
    let message = match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(api_error) => api_error.error.message,
        Err(_) => body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    };

    match status {
        429 => StageError::RateLimited {
            message,
            retry_after_secs,
        },
        401 | 403 => StageError::Authentication(message),
        _ => StageError::Provider { status, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_429_is_rate_limited_with_hint() {
        let body = r#"{"error": {"message": "Rate limit reached for model", "type": "tokens"}}"#;
        match classify_failure(429, Some(12.0), body) {
            StageError::RateLimited {
                message,
                retry_after_secs,
            } => {
                assert_eq!(message, "Rate limit reached for model");
                assert_eq!(retry_after_secs, Some(12.0));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn test_auth_and_provider_errors_are_fatal() {
        let auth = classify_failure(401, None, r#"{"error": {"message": "Invalid API Key"}}"#);
        assert!(matches!(auth, StageError::Authentication(ref m) if m == "Invalid API Key"));
        assert!(!auth.is_rate_limited());

        let server = classify_failure(503, None, "upstream unavailable");
        assert!(matches!(
            server,
            StageError::Provider { status: 503, ref message } if message == "upstream unavailable"
        ));
    }

    #[test]
    fn test_long_error_bodies_are_truncated() {
        let body = "x".repeat(2_000);
        match classify_failure(500, None, &body) {
            StageError::Provider { message, .. } => assert_eq!(message.len(), MAX_ERROR_BODY_CHARS),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(parse_retry_after(&headers), Some(3.0));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_request_serialization() {
        let messages = vec![Message::system("be brief"), Message::user("hello")];
        let payload = ChatCompletionRequest {
            model: "llama3.3-70b",
            messages: &messages,
            max_tokens: 256,
            temperature: 0.2,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["model"], "llama3.3-70b");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hello");
        assert_eq!(json["max_tokens"], 256);
    }

    #[test]
    fn test_response_parsing_tolerates_missing_usage() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "hi"}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.usage.is_none());
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hi"));
    }
}
