//! Inbound webhook payload model.
//!
//! The provider's JSON is deserialized into loose structs and then converted
//! into [`WebhookEvent`]s whose content is a closed [`InboundContent`] union.

use crate::types::{MediaId, PhoneNumber, WaMessageId};
use serde::{Deserialize, Serialize};

/// The only `object` value that carries WhatsApp business messages.
pub const WHATSAPP_BUSINESS_ACCOUNT: &str = "whatsapp_business_account";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: WebhookValue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookValue {
    #[serde(default)]
    pub contacts: Vec<WebhookContact>,
    #[serde(default)]
    pub messages: Vec<WebhookMessage>,
    #[serde(default)]
    pub statuses: Vec<WebhookStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookContact {
    #[serde(default)]
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<ContactProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookMessage {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub audio: Option<MediaBody>,
    #[serde(default)]
    pub image: Option<MediaBody>,
    #[serde(default)]
    pub video: Option<MediaBody>,
    #[serde(default)]
    pub document: Option<MediaBody>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextBody {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaBody {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundContent {
    Text { body: String },
    Audio { media_id: MediaId, mime_type: String },
    Image,
    Video,
    Document,
    /// Any other message type (stickers, reactions, locations...).
    Unsupported { kind: String },
}

impl WebhookMessage {
    pub fn content(&self) -> InboundContent {
        match self.message_type.as_str() {
            "text" => InboundContent::Text {
                body: self
                    .text
                    .as_ref()
                    .map(|t| t.body.clone())
                    .unwrap_or_default(),
            },
            "audio" => match self.audio.as_ref().filter(|a| !a.id.trim().is_empty()) {
                Some(audio) => InboundContent::Audio {
                    media_id: MediaId::new(audio.id.trim()),
                    mime_type: audio.mime_type.clone().unwrap_or_default(),
                },
                None => InboundContent::Unsupported {
                    kind: "audio".to_string(),
                },
            },
            "image" => InboundContent::Image,
            "video" => InboundContent::Video,
            "document" => InboundContent::Document,
            other => InboundContent::Unsupported {
                kind: other.to_string(),
            },
        }
    }
}

/// One inbound customer message, ready for the conversation pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundUnit {
    pub sender: PhoneNumber,
    pub message_id: WaMessageId,
    /// Raw profile name as sent by the provider; not sanitized.
    pub display_name: String,
    pub content: InboundContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub message_id: WaMessageId,
    pub status: String,
    pub recipient: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Message(InboundUnit),
    Status(StatusUpdate),
}

impl WebhookPayload {
    pub fn is_business_account(&self) -> bool {
        self.object == WHATSAPP_BUSINESS_ACCOUNT
    }

    /// Flattens entries/changes into events, preserving provider order.
    ///
    /// Messages without a usable sender are dropped.
    pub fn events(&self) -> Vec<WebhookEvent> {
        let mut out = Vec::new();
        for entry in &self.entry {
            for change in &entry.changes {
                let value = &change.value;
                for message in &value.messages {
                    let Some(sender) = PhoneNumber::normalize(&message.from) else {
                        tracing::debug!(message_id = %message.id, "dropping message without sender");
                        continue;
                    };
                    out.push(WebhookEvent::Message(InboundUnit {
                        display_name: display_name_for(&value.contacts, &sender),
                        sender,
                        message_id: WaMessageId::new(message.id.trim()),
                        content: message.content(),
                    }));
                }
                for status in &value.statuses {
                    out.push(WebhookEvent::Status(StatusUpdate {
                        message_id: WaMessageId::new(status.id.trim()),
                        status: status.status.clone(),
                        recipient: status.recipient_id.clone(),
                    }));
                }
            }
        }
        out
    }
}

fn display_name_for(contacts: &[WebhookContact], sender: &PhoneNumber) -> String {
    let profile_name = |c: &WebhookContact| c.profile.as_ref().map(|p| p.name.clone());
    contacts
        .iter()
        .find(|c| {
            PhoneNumber::normalize(&c.wa_id)
                .map(|id| &id == sender)
                .unwrap_or(false)
        })
        .and_then(profile_name)
        .or_else(|| contacts.first().and_then(profile_name))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "WABA", "changes": [{"field": "messages", "value": value}]}]
        }))
        .expect("payload")
    }

    #[test]
    fn text_audio_and_media_messages_map_to_content_variants() {
        let p = payload(json!({
            "contacts": [{"wa_id": "5511999990000", "profile": {"name": "joão"}}],
            "messages": [
                {"from": "5511999990000", "id": "wamid.1", "type": "text", "text": {"body": "oi"}},
                {"from": "5511999990000", "id": "wamid.2", "type": "audio",
                 "audio": {"id": "media-1", "mime_type": "audio/ogg; codecs=opus"}},
                {"from": "5511999990000", "id": "wamid.3", "type": "image", "image": {"id": "m2"}},
                {"from": "5511999990000", "id": "wamid.4", "type": "sticker"}
            ]
        }));
        assert!(p.is_business_account());
        let events = p.events();
        assert_eq!(events.len(), 4);

        let contents: Vec<InboundContent> = events
            .iter()
            .map(|e| match e {
                WebhookEvent::Message(unit) => unit.content.clone(),
                WebhookEvent::Status(_) => panic!("unexpected status"),
            })
            .collect();
        assert_eq!(contents[0], InboundContent::Text { body: "oi".into() });
        assert_eq!(
            contents[1],
            InboundContent::Audio {
                media_id: MediaId::new("media-1"),
                mime_type: "audio/ogg; codecs=opus".into(),
            }
        );
        assert_eq!(contents[2], InboundContent::Image);
        assert_eq!(
            contents[3],
            InboundContent::Unsupported {
                kind: "sticker".into()
            }
        );
    }

    #[test]
    fn display_name_prefers_matching_contact() {
        let p = payload(json!({
            "contacts": [
                {"wa_id": "111", "profile": {"name": "Outro"}},
                {"wa_id": "222", "profile": {"name": "Maria"}}
            ],
            "messages": [{"from": "222", "id": "w", "type": "text", "text": {"body": "oi"}}]
        }));
        let WebhookEvent::Message(unit) = &p.events()[0] else {
            panic!("expected message");
        };
        assert_eq!(unit.display_name, "Maria");
        assert_eq!(unit.sender.as_str(), "222");
    }

    #[test]
    fn statuses_and_senderless_messages() {
        let p = payload(json!({
            "messages": [{"from": "", "id": "w", "type": "text", "text": {"body": "x"}}],
            "statuses": [{"id": "wamid.out", "status": "delivered", "recipient_id": "5511"}]
        }));
        let events = p.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            WebhookEvent::Status(s) if s.status == "delivered" && s.message_id.as_str() == "wamid.out"
        ));
    }

    #[test]
    fn audio_without_media_id_is_unsupported() {
        let message = WebhookMessage {
            from: "1".into(),
            id: "w".into(),
            message_type: "audio".into(),
            ..Default::default()
        };
        assert!(matches!(message.content(), InboundContent::Unsupported { .. }));
    }
}
