//! Webhook controller: handshake verification and the per-message pipeline.
//!
//! Each inbound unit runs sequentially through content resolution, rate
//! limiting, persistence, handoff detection, the bot/human mode check and
//! reply generation. A stage either hands its output to the next one or stops
//! the unit with a [`UnitOutcome`].

use crate::config::RepliesConfig;
use crate::contact_name::sanitize_contact_name;
use crate::handoff::HandoffDetector;
use crate::locks::ConversationLocks;
use crate::media::{Transcriber, is_audio_supported};
use crate::rate_limit::RateLimiter;
use crate::responder::{GenerationRequest, ResponseGenerator};
use crate::store::{Conversation, ConversationMode, ConversationStore, NewMessage};
use anyhow::{Context, Result, anyhow};
use pz_channels::{
    InboundContent, InboundUnit, MessagingProvider, OutboundImage, PhoneNumber, SendReceipt,
    WebhookEvent, WebhookPayload,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Echo this challenge back with 200.
    Accepted(String),
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Replied,
    FallbackSent,
    HandedOff,
    HumanMode,
    RateLimited,
    AudioUnsupported,
    AudioFailed,
    MediaUnsupported,
    UnsupportedType,
    Empty,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Payload was not a WhatsApp business account event.
    pub ignored: bool,
    pub statuses: usize,
    pub units: Vec<UnitOutcome>,
}

impl DeliveryReport {
    pub fn failed(&self) -> usize {
        self.units
            .iter()
            .filter(|o| **o == UnitOutcome::Failed)
            .count()
    }
}

enum Flow<T> {
    Continue(T),
    Stop(UnitOutcome),
}

macro_rules! advance {
    ($stage:expr) => {
        match $stage {
            Flow::Continue(value) => value,
            Flow::Stop(outcome) => return Ok(outcome),
        }
    };
}

/// Everything the controller needs, injected at startup.
pub struct WebhookDeps {
    pub verify_token: String,
    pub store: Arc<dyn ConversationStore>,
    pub provider: Arc<dyn MessagingProvider>,
    pub transcriber: Transcriber,
    pub rate_limiter: Arc<RateLimiter>,
    pub locks: Arc<ConversationLocks>,
    pub handoff: HandoffDetector,
    /// `None` when no LLM credential is configured; every reply falls back.
    pub generator: Option<Arc<dyn ResponseGenerator>>,
    pub replies: RepliesConfig,
    pub history_limit: usize,
    pub generation_timeout: Duration,
}

pub struct WebhookController {
    verify_token: String,
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn MessagingProvider>,
    transcriber: Transcriber,
    rate_limiter: Arc<RateLimiter>,
    locks: Arc<ConversationLocks>,
    handoff: HandoffDetector,
    generator: Option<Arc<dyn ResponseGenerator>>,
    replies: RepliesConfig,
    history_limit: usize,
    generation_timeout: Duration,
}

impl WebhookController {
    pub fn new(deps: WebhookDeps) -> Self {
        Self {
            verify_token: deps.verify_token,
            store: deps.store,
            provider: deps.provider,
            transcriber: deps.transcriber,
            rate_limiter: deps.rate_limiter,
            locks: deps.locks,
            handoff: deps.handoff,
            generator: deps.generator,
            replies: deps.replies,
            history_limit: deps.history_limit.max(1),
            generation_timeout: deps.generation_timeout,
        }
    }

    /// Subscription handshake. Pure and repeatable.
    pub fn verify(&self, mode: &str, token: &str, challenge: &str) -> VerifyOutcome {
        let expected = self.verify_token.trim();
        if mode == "subscribe" && !expected.is_empty() && token == expected {
            VerifyOutcome::Accepted(challenge.to_string())
        } else {
            VerifyOutcome::Rejected
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn deliver(&self, payload: &WebhookPayload) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if !payload.is_business_account() {
            tracing::debug!(object = %payload.object, "ignoring non-whatsapp webhook object");
            report.ignored = true;
            return report;
        }

        for event in payload.events() {
            match event {
                WebhookEvent::Status(status) => {
                    tracing::debug!(
                        provider_message_id = %status.message_id,
                        status = %status.status,
                        recipient = %status.recipient,
                        "delivery status"
                    );
                    report.statuses += 1;
                }
                WebhookEvent::Message(unit) => {
                    let outcome = match self.process_unit(&unit).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!(
                                sender = %unit.sender,
                                provider_message_id = %unit.message_id,
                                error = %format!("{e:#}"),
                                "inbound message failed"
                            );
                            UnitOutcome::Failed
                        }
                    };
                    report.units.push(outcome);
                }
            }
        }
        report
    }

    /// Staff-driven mode change. Serialized against in-flight units for the
    /// same sender.
    #[tracing::instrument(level = "info", skip(self), fields(conversation_id = %conversation_id))]
    pub async fn set_mode(
        &self,
        conversation_id: Uuid,
        mode: ConversationMode,
    ) -> Result<Option<Conversation>> {
        let Some(conversation) = self.store.get_conversation(conversation_id).await? else {
            return Ok(None);
        };
        let _guard = self.locks.acquire(&conversation.phone).await;
        let updated = self.store.set_mode(conversation_id, mode).await?;
        tracing::info!(mode = mode.as_str(), "conversation mode changed by staff");
        Ok(updated)
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            sender = %unit.sender,
            provider_message_id = %unit.message_id,
            conversation_id = tracing::field::Empty
        )
    )]
    async fn process_unit(&self, unit: &InboundUnit) -> Result<UnitOutcome> {
        let content = advance!(self.resolve_content(unit).await);
        advance!(self.check_rate_limit(&unit.sender).await);

        let _guard = self.locks.acquire(unit.sender.as_str()).await;
        let conversation = self.persist_inbound(unit, &content).await?;
        tracing::Span::current().record("conversation_id", tracing::field::display(conversation.id));

        if let Err(e) = self.provider.mark_read(&unit.message_id).await {
            tracing::warn!(error = %e, "mark_read failed");
        }

        advance!(self.detect_handoff(&conversation, &unit.sender, &content).await?);
        advance!(self.claim_for_reply(conversation.id).await?);
        self.reply(&conversation, &unit.sender, &content).await
    }

    async fn resolve_content(&self, unit: &InboundUnit) -> Flow<String> {
        let content = match &unit.content {
            InboundContent::Text { body } => body.clone(),
            InboundContent::Audio {
                media_id,
                mime_type,
            } => {
                if !is_audio_supported(mime_type) {
                    tracing::info!(mime = %mime_type, "unsupported audio format");
                    self.notify(&unit.sender, &self.replies.audio_unsupported).await;
                    return Flow::Stop(UnitOutcome::AudioUnsupported);
                }
                match self.transcriber.fetch_and_transcribe(media_id, mime_type).await {
                    Some(text) => text,
                    None => {
                        self.notify(&unit.sender, &self.replies.audio_failed).await;
                        return Flow::Stop(UnitOutcome::AudioFailed);
                    }
                }
            }
            InboundContent::Image | InboundContent::Video | InboundContent::Document => {
                self.notify(&unit.sender, &self.replies.media_unsupported).await;
                return Flow::Stop(UnitOutcome::MediaUnsupported);
            }
            InboundContent::Unsupported { kind } => {
                tracing::debug!(kind = %kind, "skipping unsupported message type");
                return Flow::Stop(UnitOutcome::UnsupportedType);
            }
        };

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Flow::Stop(UnitOutcome::Empty);
        }
        Flow::Continue(trimmed.to_string())
    }

    async fn check_rate_limit(&self, sender: &PhoneNumber) -> Flow<()> {
        let decision = self.rate_limiter.check(sender.as_str());
        if decision.allowed {
            return Flow::Continue(());
        }
        tracing::info!("sender rate limited");
        self.notify(sender, &self.replies.rate_limited).await;
        Flow::Stop(UnitOutcome::RateLimited)
    }

    async fn persist_inbound(&self, unit: &InboundUnit, content: &str) -> Result<Conversation> {
        let name = sanitize_contact_name(&unit.display_name);
        let conversation = self
            .store
            .upsert_conversation(unit.sender.as_str(), &name)
            .await
            .context("load conversation")?;
        self.store
            .append_message(NewMessage::inbound(
                conversation.id,
                content,
                unit.message_id.as_str(),
            ))
            .await
            .context("save inbound message")?;
        Ok(conversation)
    }

    async fn detect_handoff(
        &self,
        conversation: &Conversation,
        sender: &PhoneNumber,
        content: &str,
    ) -> Result<Flow<()>> {
        if conversation.mode != ConversationMode::Bot || !self.handoff.detects(content) {
            return Ok(Flow::Continue(()));
        }

        self.store
            .set_mode(conversation.id, ConversationMode::Human)
            .await
            .context("switch conversation to human")?;
        tracing::info!("handoff requested; conversation moved to human mode");

        let receipt = self.notify(sender, &self.replies.handoff_ack).await;
        self.persist_outbound(conversation.id, &self.replies.handoff_ack, receipt, false)
            .await?;
        Ok(Flow::Stop(UnitOutcome::HandedOff))
    }

    /// Reads the mode under the sender lock; only bot conversations proceed.
    async fn claim_for_reply(&self, conversation_id: Uuid) -> Result<Flow<()>> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| anyhow!("conversation {conversation_id} disappeared"))?;
        match conversation.mode {
            ConversationMode::Bot => Ok(Flow::Continue(())),
            ConversationMode::Human => {
                tracing::debug!("conversation in human mode; bot stays silent");
                Ok(Flow::Stop(UnitOutcome::HumanMode))
            }
        }
    }

    async fn reply(
        &self,
        conversation: &Conversation,
        sender: &PhoneNumber,
        content: &str,
    ) -> Result<UnitOutcome> {
        let Some(generator) = self.generator.as_ref() else {
            tracing::warn!("no response generator configured");
            return self.send_fallback(conversation.id, sender).await;
        };

        let history = self
            .store
            .recent_messages(conversation.id, self.history_limit)
            .await
            .context("load history")?;
        let request = GenerationRequest {
            conversation_id: conversation.id,
            contact_name: conversation.contact_name.clone(),
            message: content.to_string(),
            sender: sender.to_string(),
            history,
        };

        let generated =
            match tokio::time::timeout(self.generation_timeout, generator.generate(request)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    tracing::warn!(error = %format!("{e:#}"), "reply generation failed");
                    return self.send_fallback(conversation.id, sender).await;
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = self.generation_timeout.as_secs(),
                        "reply generation timed out"
                    );
                    return self.send_fallback(conversation.id, sender).await;
                }
            };

        for product in &generated.product_images {
            let Some(url) = product.image_url.clone() else {
                continue;
            };
            let image = OutboundImage {
                url,
                caption: Some(format!("{} - {}", product.name, product.display_price())),
            };
            if let Err(e) = self.provider.send_image(sender, &image).await {
                tracing::warn!(error = %e, product_id = %product.id, "send_image failed");
            }
        }

        let receipt = self
            .provider
            .send_text(sender, &generated.text)
            .await
            .context("send reply")?;
        self.persist_outbound(conversation.id, &generated.text, Some(receipt), true)
            .await?;
        Ok(UnitOutcome::Replied)
    }

    async fn send_fallback(&self, conversation_id: Uuid, sender: &PhoneNumber) -> Result<UnitOutcome> {
        let receipt = self.notify(sender, &self.replies.generation_failed).await;
        self.persist_outbound(conversation_id, &self.replies.generation_failed, receipt, false)
            .await?;
        Ok(UnitOutcome::FallbackSent)
    }

    async fn persist_outbound(
        &self,
        conversation_id: Uuid,
        text: &str,
        receipt: Option<SendReceipt>,
        processed_by_ai: bool,
    ) -> Result<()> {
        let provider_id = receipt
            .and_then(|r| r.message_id)
            .map(|id| id.into_inner());
        self.store
            .append_message(NewMessage::outbound(
                conversation_id,
                text,
                provider_id,
                processed_by_ai,
            ))
            .await
            .context("save outbound message")?;
        Ok(())
    }

    /// Sends a canned text; delivery failures are logged only.
    async fn notify(&self, to: &PhoneNumber, text: &str) -> Option<SendReceipt> {
        match self.provider.send_text(to, text).await {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                tracing::warn!(error = %e, provider = self.provider.provider_id(), "notice delivery failed");
                None
            }
        }
    }
}
