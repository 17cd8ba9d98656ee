//! Stage executor backed by a chat-completions endpoint.
//!
//! Each configured stage becomes a system prompt plus a user prompt rendered
//! from the run inputs, with the previous stage's output appended as context.
//! Prompt content is opaque here; it is whatever the operator configured.

use crate::client::{ChatRequest, LLMClient, Message};
use crate::executor::{StageExecutor, StageOutput, StageRequest};
use crate::models::{Config, CrewError, Result, StageError, StageId};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::debug;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Heading placed before the previous stage's output.
pub const CONTEXT_HEADING: &str = "Context from previous stage:";

/// How one stage talks to the model.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub model: String,
    pub label: String,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// `StageExecutor` over an OpenAI-compatible provider.
pub struct ChatStageExecutor {
    client: Arc<LLMClient>,
    /// Credential lookup key and label suffix
    provider: String,
    plans: HashMap<StageId, StagePlan>,
    /// Used when the run's credentials carry no key for `provider`
    fallback_api_key: Option<String>,
}

impl ChatStageExecutor {
    pub fn new(client: Arc<LLMClient>, plans: HashMap<StageId, StagePlan>) -> Self {
        Self {
            provider: client.name().to_string(),
            client,
            plans,
            fallback_api_key: None,
        }
    }

    /// Build from config, reading every system prompt file up front.
    pub fn from_config(config: &Config, client: Arc<LLMClient>) -> Result<Self> {
        let mut plans = HashMap::with_capacity(config.stages.len());
        for stage in &config.stages {
            let system_prompt = match &stage.system_prompt {
                Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                    CrewError::io(format!("reading system prompt {}", path.display()), e)
                })?),
                None => None,
            };

            plans.insert(
                StageId::new(stage.name.clone()),
                StagePlan {
                    model: stage.model.clone(),
                    label: stage.label().to_string(),
                    system_prompt,
                    prompt: stage.prompt.clone(),
                    max_tokens: stage.max_tokens,
                    temperature: stage.temperature,
                },
            );
        }
        Ok(Self::new(client, plans))
    }

    /// Key to use when a run supplies no credentials for this provider.
    pub fn with_fallback_api_key(mut self, api_key: Option<String>) -> Self {
        self.fallback_api_key = api_key;
        self
    }

    fn build_request(&self, plan: &StagePlan, request: &StageRequest<'_>) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &plan.system_prompt {
            messages.push(Message::system(render_prompt(system, request.inputs, None)));
        }
        messages.push(Message::user(render_prompt(
            &plan.prompt,
            request.inputs,
            request.context,
        )));

        ChatRequest {
            model: plan.model.clone(),
            messages,
            max_tokens: plan.max_tokens,
            temperature: plan.temperature,
        }
    }
}

impl StageExecutor for ChatStageExecutor {
    async fn execute(&self, request: StageRequest<'_>) -> std::result::Result<StageOutput, StageError> {
        let plan = self.plans.get(request.stage).ok_or_else(|| {
            StageError::failed(format!("no configuration for stage '{}'", request.stage))
        })?;

        let api_key = request
            .credentials
            .get(&self.provider)
            .or(self.fallback_api_key.as_deref());
        let chat = self.build_request(plan, &request);

        let response = self.client.complete(api_key, &chat).await?;
        debug!(
            stage = %request.stage,
            model = %response.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            duration_ms = response.duration.as_millis() as u64,
            "Completion received"
        );

        Ok(StageOutput::new(
            response.content,
            format!("{} ({})", plan.label, response.model),
        ))
    }
}

/// Fill `{key}` placeholders from `inputs` and append the previous stage's
/// output. Unknown placeholders are left as written.
pub fn render_prompt(
    template: &str,
    inputs: &HashMap<String, String>,
    context: Option<&str>,
) -> String {
    let mut rendered = PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            inputs
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned();

    if let Some(context) = context {
        rendered.push_str("\n\n");
        rendered.push_str(CONTEXT_HEADING);
        rendered.push('\n');
        rendered.push_str(context);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RateLimiter;
    use crate::executor::Credentials;
    use crate::models::ProviderConfig;
    use std::io::Write;

    fn inputs() -> HashMap<String, String> {
        HashMap::from([
            ("topic".to_string(), "Rust async".to_string()),
            ("audience".to_string(), "beginners".to_string()),
        ])
    }

    #[test]
    fn test_render_fills_known_placeholders() {
        let out = render_prompt("Research {topic} for {audience}.", &inputs(), None);
        assert_eq!(out, "Research Rust async for beginners.");
    }

    #[test]
    fn test_render_keeps_unknown_placeholders() {
        let out = render_prompt("Return JSON like {url} about {topic}", &inputs(), None);
        assert_eq!(out, "Return JSON like {url} about Rust async");
        // JSON braces are not placeholders.
        let json = render_prompt("[{ 'url': 1 }]", &inputs(), None);
        assert_eq!(json, "[{ 'url': 1 }]");
    }

    #[test]
    fn test_render_appends_context() {
        let out = render_prompt("Write about {topic}", &inputs(), Some("[research]"));
        assert_eq!(
            out,
            format!("Write about Rust async\n\n{CONTEXT_HEADING}\n[research]")
        );
    }

    fn client() -> Arc<LLMClient> {
        Arc::new(
            LLMClient::from_config(&ProviderConfig::default(), Arc::new(RateLimiter::default()))
                .unwrap(),
        )
    }

    #[test]
    fn test_from_config_reads_system_prompts() {
        let mut prompt_file = tempfile::NamedTempFile::new().unwrap();
        write!(prompt_file, "You research {{topic}} only.").unwrap();

        let toml = format!(
            r#"
[[stages]]
name = "plan"
model = "llama3.3-70b"
label = "planner"
system_prompt = "{}"
prompt = "Research {{topic}}"
"#,
            prompt_file.path().display()
        );
        let config: Config = toml::from_str(&toml).unwrap();
        let executor = ChatStageExecutor::from_config(&config, client()).unwrap();

        let plan = &executor.plans[&StageId::from("plan")];
        assert_eq!(plan.label, "planner");
        assert_eq!(plan.system_prompt.as_deref(), Some("You research {topic} only."));

        let inputs = inputs();
        let creds = Credentials::new();
        let stage = StageId::from("plan");
        let request = StageRequest {
            topic: "Rust async",
            stage: &stage,
            index: 0,
            inputs: &inputs,
            context: None,
            credentials: &creds,
        };
        let chat = executor.build_request(plan, &request);
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].content, "You research Rust async only.");
        assert_eq!(chat.messages[1].content, "Research Rust async");
    }

    #[test]
    fn test_from_config_missing_prompt_file_is_io_error() {
        let config: Config = toml::from_str(
            r#"
[[stages]]
name = "plan"
model = "m"
system_prompt = "/definitely/not/here.md"
"#,
        )
        .unwrap();
        let err = ChatStageExecutor::from_config(&config, client()).err().unwrap();
        assert!(matches!(err, CrewError::Io { .. }));
    }

    #[tokio::test]
    async fn test_unknown_stage_is_fatal() {
        let executor = ChatStageExecutor::new(client(), HashMap::new());
        let inputs = inputs();
        let creds = Credentials::new();
        let stage = StageId::from("edit");
        let err = executor
            .execute(StageRequest {
                topic: "t",
                stage: &stage,
                index: 2,
                inputs: &inputs,
                context: None,
                credentials: &creds,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Failed(_)));
    }
}
