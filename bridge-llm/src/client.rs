use crate::error::{LlmError, Result};
use crate::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::types::{ChatMessage, ChatResponse, ToolDefinition};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_TOOL_NAME_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct ChatCompletionConfig {
    /// Endpoint root; `/chat/completions` is appended.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl Default for ChatCompletionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct ChatCompletionClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl ChatCompletionClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(config: ChatCompletionConfig) -> Result<Self> {
        let model = config.model.trim().to_string();
        if model.is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        let base_url = config.base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(LlmError::InvalidInput("base_url is required".to_string()));
        }
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{base_url}/chat/completions"),
            api_key: config
                .api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            model,
            timeout: config.timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("messages must not be empty".to_string()));
        }
        for tool in tools {
            validate_tool_name(&tool.name)?;
        }

        let request = ChatCompletionRequest::new(&self.model, messages, tools);
        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_send_error(e))?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "chat completion status={status} body={body}"
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)?;
        let response: ChatResponse = parsed.try_into()?;
        tracing::debug!(
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            finish_reason = %response.finish_reason,
            "chat completion finished"
        );
        Ok(response)
    }

    /// Single-turn completion: optional system prompt plus one user message, text reply only.
    pub async fn complete(&self, system_prompt: Option<&str>, user_text: &str) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(prompt) = system_prompt.map(str::trim).filter(|p| !p.is_empty()) {
            messages.push(ChatMessage::system(prompt));
        }
        messages.push(ChatMessage::user(user_text));
        let response = self.chat(&messages, &[]).await?;
        let content = response.message.content.trim().to_string();
        if content.is_empty() {
            return Err(LlmError::ResponseFormat(
                "chat completion returned empty content".to_string(),
            ));
        }
        Ok(content)
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(self.timeout.as_secs())
        } else {
            LlmError::Http(e.to_string())
        }
    }
}

/// OpenAI function names must match `^[a-zA-Z0-9_-]{1,64}$`.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TOOL_NAME_LEN {
        return Err(LlmError::InvalidInput(format!(
            "tool name must be 1..={MAX_TOOL_NAME_LEN} chars: {name:?}"
        )));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name has invalid characters: {name:?}"
        )));
    }
    Ok(())
}
