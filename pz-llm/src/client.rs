use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %model))]
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::InvalidInput("api key is required".to_string()));
        }
        let model = model.trim();
        if model.is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            provider: detect_provider(model),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens: 1024,
            base_url: None,
            client,
        })
    }

    /// Points the client at an API-compatible gateway instead of the vendor default.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let trimmed = base_url.trim().trim_end_matches('/');
        self.base_url = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = ?self.provider, model = %self.model))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("messages are empty".to_string()));
        }
        match self.provider {
            Provider::OpenAI => {
                let mut c = OpenAiClient::new(self.client.clone(), &self.api_key, &self.model);
                if let Some(base_url) = self.base_url.as_deref() {
                    c = c.with_base_url(base_url);
                }
                c.chat(messages, self.max_tokens).await
            }
            Provider::Anthropic => {
                let mut c = AnthropicClient::new(self.client.clone(), &self.api_key, &self.model);
                if let Some(base_url) = self.base_url.as_deref() {
                    c = c.with_base_url(base_url);
                }
                c.chat(messages, self.max_tokens).await
            }
        }
    }
}

fn detect_provider(model: &str) -> Provider {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude-") {
        return Provider::Anthropic;
    }
    Provider::OpenAI
}
