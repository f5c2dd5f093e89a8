//! Speech-to-text over the OpenAI-compatible `audio/transcriptions` endpoint.

use crate::error::{LlmError, Result};
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;

const TRANSCRIPTION_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct TranscriptionClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    language: String,
    base_url: String,
}

impl TranscriptionClient {
    pub fn new(api_key: &str, model: &str, language: &str, timeout: Duration) -> Result<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(LlmError::InvalidInput(
                "transcription api key is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: model.trim().to_string(),
            language: language.trim().to_string(),
            base_url: TRANSCRIPTION_API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let trimmed = base_url.trim().trim_end_matches('/');
        if !trimmed.is_empty() {
            self.base_url = trimmed.to_string();
        }
        self
    }

    /// Uploads `audio` as `file_name` and returns the transcript text.
    #[tracing::instrument(level = "info", skip_all, fields(file_name = %file_name, bytes = audio.len()))]
    pub async fn transcribe(&self, audio: Bytes, file_name: &str, mime_type: &str) -> Result<String> {
        if audio.is_empty() {
            return Err(LlmError::InvalidInput("audio buffer is empty".to_string()));
        }
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| LlmError::InvalidInput(format!("invalid audio mime type: {e}")))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");
        if !self.language.is_empty() {
            form = form.text("language", self.language.clone());
        }

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "transcription status={status} body={body}"
            )));
        }

        let parsed: TranscriptionResponse = serde_json::from_str(&body)?;
        Ok(parsed.text.trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}
