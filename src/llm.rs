//! Generation client: the trait the orchestrator drives, plus the bundled
//! Anthropic Messages API implementation.

use crate::errors::{PipelineError, Result};
use crate::prompts::{self, PromptInputs, Refinement};
use crate::session::CodeArtifact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One generation round's result: the candidate program and what it cost.
#[derive(Debug, Clone)]
pub struct Generation {
    pub code: CodeArtifact,
    pub tokens_used: u64,
}

/// Dataset and instruction context for a first-attempt generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub instruction: String,
    pub profile_text: String,
    pub column_names: Vec<String>,
    pub sample_rows_markdown: String,
    pub project_context: Option<String>,
}

/// A refinement call: the same context plus the failed code and its error.
#[derive(Debug, Clone)]
pub struct RefinementRequest {
    pub base: GenerationRequest,
    pub previous_code: String,
    pub error_text: String,
}

/// The black-box code generator the orchestrator drives.
///
/// Both calls are synchronous from the orchestrator's point of view; upstream
/// transport failures come back as `PipelineError::GenerationUnavailable`,
/// never as a panic or a retryable attempt.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;
    async fn refine(&self, request: &RefinementRequest) -> Result<Generation>;
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    /// Client configured from `ANTHROPIC_API_KEY`, with optional
    /// `CLAUDE_MODEL` / `CLAUDE_MAX_TOKENS` overrides.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            PipelineError::GenerationUnavailable("ANTHROPIC_API_KEY is not set".to_string())
        })?;
        let mut client = Self::new(api_key)?;
        if let Ok(model) = std::env::var("CLAUDE_MODEL") {
            client.model = model;
        }
        if let Ok(max_tokens) = std::env::var("CLAUDE_MAX_TOKENS") {
            if let Ok(value) = max_tokens.parse() {
                client.max_tokens = value;
            }
        }
        Ok(client)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn complete(&self, system: String, messages: Vec<ChatMessage>) -> Result<Generation> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: &system,
            temperature: 0.0,
            messages: &messages,
        };

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::GenerationUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PipelineError::GenerationUnavailable(format!(
                "API returned {status}: {detail}"
            )));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::MalformedGeneration(e.to_string()))?;
        let text = parsed
            .content
            .first()
            .map(|block| block.text.as_str())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(PipelineError::MalformedGeneration(
                "response contained no text content".to_string(),
            ));
        }

        let tokens_used = parsed.usage.input_tokens + parsed.usage.output_tokens;
        debug!("[LLM] {} tokens consumed by {}", tokens_used, self.model);
        Ok(Generation {
            code: CodeArtifact::new(extract_code(text)),
            tokens_used,
        })
    }
}

#[async_trait]
impl GenerationClient for AnthropicClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let system = prompts::build_system_prompt(request.project_context.as_deref());
        let messages = prompts::build_messages(&prompt_inputs(request, None));
        self.complete(system, messages).await
    }

    async fn refine(&self, request: &RefinementRequest) -> Result<Generation> {
        let system = prompts::build_system_prompt(request.base.project_context.as_deref());
        let refinement = Refinement {
            previous_code: request.previous_code.clone(),
            error_text: request.error_text.clone(),
        };
        let messages = prompts::build_messages(&prompt_inputs(&request.base, Some(refinement)));
        self.complete(system, messages).await
    }
}

fn prompt_inputs(request: &GenerationRequest, refinement: Option<Refinement>) -> PromptInputs {
    PromptInputs {
        user_prompt: request.instruction.clone(),
        profile_text: request.profile_text.clone(),
        column_names: request.column_names.clone(),
        sample_rows_markdown: request.sample_rows_markdown.clone(),
        refinement,
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    temperature: f32,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Pull the program text out of a model response: prefer a ```python block,
/// fall back to any fenced block, and finally treat the whole response as
/// code.
pub fn extract_code(response: &str) -> String {
    if let Some(block) = fenced_block(response, "```python") {
        return block;
    }
    if let Some(block) = fenced_block(response, "```") {
        return block;
    }
    response.trim().to_string()
}

fn fenced_block(text: &str, fence: &str) -> Option<String> {
    let start = text.find(fence)? + fence.len();
    let rest = text.get(start..)?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_python_fenced_block() {
        let response = "Here you go:\n```python\nfig = px.bar(df, x='a', y='b')\n```\nThis shows a bar chart.";
        assert_eq!(extract_code(response), "fig = px.bar(df, x='a', y='b')");
    }

    #[test]
    fn falls_back_to_generic_fence() {
        let response = "```\nfig = 1\n```";
        assert_eq!(extract_code(response), "fig = 1");
    }

    #[test]
    fn falls_back_to_raw_text() {
        assert_eq!(extract_code("  fig = 2  "), "fig = 2");
    }

    #[test]
    fn prefers_python_block_over_earlier_generic_fence() {
        let response = "```\nnot this\n```\n```python\nfig = 3\n```";
        assert_eq!(extract_code(response), "fig = 3");
    }
}
