use crate::traits::{MediaSource, MessagingProvider};
use crate::types::{MediaId, OutboundImage, PhoneNumber, SendReceipt, WaMessageId};
use anyhow::{Result, anyhow};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::time::Duration;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";

/// WhatsApp text messages are capped at 4096 characters.
const MAX_TEXT_CHARS: usize = 4096;

/// Largest attachment the client will buffer.
pub const MAX_MEDIA_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct WhatsAppCloudClient {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
    api_base: String,
    max_media_bytes: usize,
}

impl WhatsAppCloudClient {
    pub fn new(access_token: &str, phone_number_id: &str, timeout: Duration) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("whatsapp access token is required"));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(anyhow!("whatsapp phone number id is required"));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
            api_base: GRAPH_API_BASE.to_string(),
            max_media_bytes: MAX_MEDIA_BYTES,
        })
    }

    pub fn with_max_media_bytes(mut self, max_media_bytes: usize) -> Self {
        self.max_media_bytes = max_media_bytes;
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        let api_base = api_base.into();
        let trimmed = api_base.trim().trim_end_matches('/');
        if !trimmed.is_empty() {
            self.api_base = trimmed.to_string();
        }
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.api_base, self.phone_number_id)
    }

    async fn post_message(&self, payload: serde_json::Value) -> Result<SendReceipt> {
        let response = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp send failed: status={} body={}",
                status,
                body
            ));
        }
        let parsed: SendResponse = serde_json::from_str(&body).unwrap_or_default();
        Ok(SendReceipt {
            message_id: parsed
                .messages
                .into_iter()
                .next()
                .map(|m| m.id)
                .filter(|id| !id.is_empty())
                .map(WaMessageId::new),
        })
    }

    async fn resolve_media_url(&self, media_id: &MediaId) -> Result<String> {
        let response = self
            .http
            .get(format!("{}/{}", self.api_base, media_id))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("media lookup failed: status={status}"));
        }
        let parsed: MediaLookup = response.json().await?;
        let url = parsed.url.trim();
        if url.is_empty() {
            return Err(anyhow!("media lookup returned no url"));
        }
        Ok(url.to_string())
    }

    async fn download(&self, url: &str) -> Result<Bytes> {
        let mut response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("media download failed: status={status}"));
        }
        let limit = self.max_media_bytes;
        if let Some(len) = response.content_length().filter(|len| *len > limit as u64) {
            return Err(anyhow!("media of {len} bytes exceeds limit of {limit}"));
        }
        let mut buf = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if buf.len() + chunk.len() > limit {
                return Err(anyhow!("media exceeds limit of {limit} bytes"));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

#[async_trait::async_trait]
impl MessagingProvider for WhatsAppCloudClient {
    fn provider_id(&self) -> &str {
        "whatsapp"
    }

    #[tracing::instrument(level = "info", skip_all, fields(to = %to))]
    async fn send_text(&self, to: &PhoneNumber, body: &str) -> Result<SendReceipt> {
        let text = body.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }
        let text: String = text.chars().take(MAX_TEXT_CHARS).collect();
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to.as_str(),
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text,
            }
        }))
        .await
    }

    #[tracing::instrument(level = "info", skip_all, fields(to = %to))]
    async fn send_image(&self, to: &PhoneNumber, image: &OutboundImage) -> Result<SendReceipt> {
        let url = image.url.trim();
        if url.is_empty() {
            return Err(anyhow!("image url is empty"));
        }
        let mut body = serde_json::json!({ "link": url });
        if let Some(caption) = image.caption.as_deref().filter(|c| !c.trim().is_empty()) {
            body["caption"] = serde_json::Value::String(caption.trim().to_string());
        }
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to.as_str(),
            "type": "image",
            "image": body,
        }))
        .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(message_id = %message_id))]
    async fn mark_read(&self, message_id: &WaMessageId) -> Result<()> {
        if message_id.trim().is_empty() {
            return Err(anyhow!("message id is required"));
        }
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id.as_str(),
        }))
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MediaSource for WhatsAppCloudClient {
    #[tracing::instrument(level = "info", skip_all, fields(media_id = %media_id))]
    async fn fetch_media(&self, media_id: &MediaId) -> Option<Bytes> {
        let url = match self.resolve_media_url(media_id).await {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "whatsapp media url resolution failed");
                return None;
            }
        };
        match self.download(&url).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "whatsapp media download failed");
                None
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct SentMessage {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct MediaLookup {
    #[serde(default)]
    url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base: &str) -> WhatsAppCloudClient {
        WhatsAppCloudClient::new("token", "PNID", Duration::from_secs(5))
            .expect("client")
            .with_api_base(base)
    }

    fn phone() -> PhoneNumber {
        PhoneNumber::normalize("5511999990000").expect("phone")
    }

    #[test]
    fn new_requires_credentials() {
        assert!(WhatsAppCloudClient::new("", "PNID", Duration::from_secs(1)).is_err());
        assert!(WhatsAppCloudClient::new("t", " ", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn send_text_returns_provider_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/PNID/messages"))
            .and(header("authorization", "Bearer token"))
            .and(body_partial_json(serde_json::json!({
                "to": "5511999990000",
                "type": "text",
                "text": {"body": "Olá!"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messaging_product": "whatsapp",
                "messages": [{"id": "wamid.out.1"}]
            })))
            .mount(&server)
            .await;

        let receipt = client(&server.uri())
            .send_text(&phone(), "  Olá!  ")
            .await
            .expect("send ok");
        assert_eq!(receipt.message_id, Some(WaMessageId::new("wamid.out.1")));
    }

    #[tokio::test]
    async fn send_image_includes_caption() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/PNID/messages"))
            .and(body_partial_json(serde_json::json!({
                "type": "image",
                "image": {"link": "https://cdn.example/p.jpg", "caption": "Pneu 175/70R13"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let receipt = client(&server.uri())
            .send_image(
                &phone(),
                &OutboundImage {
                    url: "https://cdn.example/p.jpg".into(),
                    caption: Some("Pneu 175/70R13".into()),
                },
            )
            .await
            .expect("send ok");
        assert_eq!(receipt.message_id, None);
    }

    #[tokio::test]
    async fn send_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad"))
            .mount(&server)
            .await;
        assert!(client(&server.uri()).send_text(&phone(), "x").await.is_err());
    }

    #[tokio::test]
    async fn fetch_media_follows_two_step_protocol() {
        let server = MockServer::start().await;
        let download_url = format!("{}/download/media-1", server.uri());
        Mock::given(method("GET"))
            .and(path("/media-1"))
            .and(header("authorization", "Bearer token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"url": download_url})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/media-1"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"OggS-audio".to_vec()))
            .mount(&server)
            .await;

        let bytes = client(&server.uri())
            .fetch_media(&MediaId::new("media-1"))
            .await
            .expect("media bytes");
        assert_eq!(&bytes[..], b"OggS-audio");
    }

    #[tokio::test]
    async fn oversized_media_is_refused() {
        let server = MockServer::start().await;
        let download_url = format!("{}/download/media-big", server.uri());
        Mock::given(method("GET"))
            .and(path("/media-big"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"url": download_url})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/media-big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;

        let small = client(&server.uri()).with_max_media_bytes(16);
        let err = small
            .download(&download_url)
            .await
            .expect_err("over the limit");
        assert!(err.to_string().contains("exceeds limit"), "{err}");
        assert!(small.fetch_media(&MediaId::new("media-big")).await.is_none());

        let roomy = client(&server.uri()).with_max_media_bytes(64);
        let bytes = roomy.download(&download_url).await.expect("within limit");
        assert_eq!(bytes.len(), 64);
    }

    #[tokio::test]
    async fn fetch_media_soft_fails_on_download_error() {
        let server = MockServer::start().await;
        let download_url = format!("{}/download/media-2", server.uri());
        Mock::given(method("GET"))
            .and(path("/media-2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"url": download_url})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/media-2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(
            client(&server.uri())
                .fetch_media(&MediaId::new("media-2"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn fetch_media_soft_fails_on_lookup_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media-3"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        assert!(
            client(&server.uri())
                .fetch_media(&MediaId::new("media-3"))
                .await
                .is_none()
        );
    }
}
