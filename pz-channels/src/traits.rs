use crate::types::{MediaId, OutboundImage, PhoneNumber, SendReceipt, WaMessageId};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Stable provider identifier, e.g. "whatsapp".
    fn provider_id(&self) -> &str;

    async fn send_text(&self, to: &PhoneNumber, body: &str) -> Result<SendReceipt>;

    async fn send_image(&self, to: &PhoneNumber, image: &OutboundImage) -> Result<SendReceipt>;

    /// Read receipt for an inbound message.
    async fn mark_read(&self, message_id: &WaMessageId) -> Result<()>;
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Downloads an attachment. Any provider failure yields `None`.
    async fn fetch_media(&self, media_id: &MediaId) -> Option<Bytes>;
}
