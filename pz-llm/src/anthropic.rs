use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, ChatResponse, Role, Usage};
use serde::{Deserialize, Serialize};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: &str, model: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: ANTHROPIC_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<ChatResponse> {
        let req = AnthropicRequest::new(&self.model, messages, max_tokens)?;

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "anthropic chat status={status} body={body}"
            )));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&body)?;
        Ok(parsed.into())
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
}

impl AnthropicRequest {
    fn new(model: &str, messages: &[ChatMessage], max_tokens: u32) -> Result<Self> {
        let mut system_parts = Vec::new();
        let mut out: Vec<AnthropicMessage> = Vec::new();

        for m in messages {
            let role = match m.role {
                Role::System => {
                    system_parts.push(m.content.clone());
                    continue;
                }
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            // Consecutive turns from the same side are merged; the API rejects them otherwise.
            match out.last_mut() {
                Some(last) if last.role == role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&m.content);
                }
                _ => out.push(AnthropicMessage {
                    role,
                    content: m.content.clone(),
                }),
            }
        }

        if out.first().map(|m| m.role) != Some("user") {
            return Err(LlmError::InvalidInput(
                "anthropic conversations must start with a user message".to_string(),
            ));
        }

        Ok(Self {
            model: model.to_string(),
            max_tokens,
            system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            messages: out,
        })
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl From<AnthropicResponse> for ChatResponse {
    fn from(v: AnthropicResponse) -> Self {
        let mut content = String::new();
        for block in v.content {
            if let AnthropicContentBlock::Text { text } = block {
                content.push_str(&text);
            }
        }

        ChatResponse {
            message: ChatMessage::assistant(content),
            usage: Usage {
                prompt_tokens: v.usage.input_tokens as u32,
                completion_tokens: v.usage.output_tokens as u32,
            },
            finish_reason: v.stop_reason.unwrap_or_else(|| "unknown".to_string()),
        }
    }
}
