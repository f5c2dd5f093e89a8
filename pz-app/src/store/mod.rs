//! Conversation store: conversations, append-only messages and staff feedback.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    #[default]
    Bot,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Positive,
    Negative,
    Correction,
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

text_enum!(ConversationMode { Bot => "bot", Human => "human" });
text_enum!(ConversationStatus { Active => "active", Archived => "archived" });
text_enum!(Direction { Inbound => "inbound", Outbound => "outbound" });
text_enum!(FeedbackKind { Positive => "positive", Negative => "negative", Correction => "correction" });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    /// Sender phone, digits only. Unique per store.
    pub phone: String,
    pub contact_name: String,
    pub status: ConversationStatus,
    pub mode: ConversationMode,
    pub message_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub direction: Direction,
    pub content: String,
    pub provider_message_id: Option<String>,
    pub processed_by_ai: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub direction: Direction,
    pub content: String,
    pub provider_message_id: Option<String>,
    pub processed_by_ai: bool,
}

impl NewMessage {
    pub fn inbound(conversation_id: Uuid, content: &str, provider_message_id: &str) -> Self {
        Self {
            conversation_id,
            direction: Direction::Inbound,
            content: content.to_string(),
            provider_message_id: Some(provider_message_id.to_string()).filter(|id| !id.is_empty()),
            processed_by_ai: false,
        }
    }

    pub fn outbound(
        conversation_id: Uuid,
        content: &str,
        provider_message_id: Option<String>,
        processed_by_ai: bool,
    ) -> Self {
        Self {
            conversation_id,
            direction: Direction::Outbound,
            content: content.to_string(),
            provider_message_id,
            processed_by_ai,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub kind: FeedbackKind,
    pub comment: Option<String>,
    pub correction: Option<String>,
    pub staff_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFeedback {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub kind: FeedbackKind,
    pub comment: Option<String>,
    pub correction: Option<String>,
    pub staff_id: Option<String>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns the conversation for `phone`, creating it when new.
    ///
    /// A non-empty `contact_name` replaces the stored one; an empty name never
    /// erases a known name.
    async fn upsert_conversation(&self, phone: &str, contact_name: &str) -> Result<Conversation>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;

    async fn find_by_phone(&self, phone: &str) -> Result<Option<Conversation>>;

    /// Most recently active first.
    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>>;

    async fn set_mode(&self, id: Uuid, mode: ConversationMode) -> Result<Option<Conversation>>;

    /// Appends a message and bumps the conversation counters.
    async fn append_message(&self, message: NewMessage) -> Result<Message>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>>;

    /// The last `limit` messages, oldest first.
    async fn recent_messages(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Message>>;

    async fn insert_feedback(&self, feedback: NewFeedback) -> Result<Feedback>;

    /// All feedback, newest first.
    async fn list_feedback(&self) -> Result<Vec<Feedback>>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every store implementation must share.

    use super::*;

    pub async fn one_conversation_per_phone(store: &dyn ConversationStore) {
        let first = store
            .upsert_conversation("5511999990000", "João")
            .await
            .expect("create");
        let second = store
            .upsert_conversation("5511999990000", "")
            .await
            .expect("lookup");
        assert_eq!(first.id, second.id);
        assert_eq!(second.contact_name, "João");
        assert_eq!(second.mode, ConversationMode::Bot);
        assert_eq!(second.status, ConversationStatus::Active);

        let renamed = store
            .upsert_conversation("5511999990000", "Joao")
            .await
            .expect("rename");
        assert_eq!(renamed.contact_name, "Joao");

        let other = store
            .upsert_conversation("5521988887777", "")
            .await
            .expect("other");
        assert_ne!(other.id, first.id);
        assert_eq!(store.list_conversations(10).await.expect("list").len(), 2);
        assert_eq!(
            store
                .find_by_phone("5511999990000")
                .await
                .expect("find")
                .map(|c| c.id),
            Some(first.id)
        );
    }

    pub async fn messages_are_append_only_and_ordered(store: &dyn ConversationStore) {
        let conv = store.upsert_conversation("551100", "").await.expect("conv");
        for i in 0..5 {
            store
                .append_message(NewMessage::inbound(conv.id, &format!("msg {i}"), &format!("w{i}")))
                .await
                .expect("append");
        }
        let all = store.recent_messages(conv.id, 50).await.expect("recent");
        let contents: Vec<&str> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
        assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let tail = store.recent_messages(conv.id, 2).await.expect("tail");
        let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 3", "msg 4"]);

        let reloaded = store
            .get_conversation(conv.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(reloaded.message_count, 5);
        assert_eq!(reloaded.last_message_at, Some(all[4].created_at));
    }

    pub async fn mode_and_feedback_round_trip(store: &dyn ConversationStore) {
        let conv = store.upsert_conversation("5531", "").await.expect("conv");
        let updated = store
            .set_mode(conv.id, ConversationMode::Human)
            .await
            .expect("set mode")
            .expect("exists");
        assert_eq!(updated.mode, ConversationMode::Human);
        assert!(
            store
                .set_mode(Uuid::new_v4(), ConversationMode::Bot)
                .await
                .expect("set mode")
                .is_none()
        );

        let reply = store
            .append_message(NewMessage::outbound(
                conv.id,
                "Temos sim!",
                Some("wamid.out".into()),
                true,
            ))
            .await
            .expect("append");
        let fetched = store
            .get_message(reply.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(fetched, reply);

        for kind in [FeedbackKind::Positive, FeedbackKind::Correction] {
            store
                .insert_feedback(NewFeedback {
                    conversation_id: conv.id,
                    message_id: reply.id,
                    kind,
                    comment: Some("ok".into()),
                    correction: (kind == FeedbackKind::Correction).then(|| "preço é 200".into()),
                    staff_id: None,
                })
                .await
                .expect("feedback");
        }
        let all = store.list_feedback().await.expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, FeedbackKind::Correction);
        assert_eq!(all[0].correction.as_deref(), Some("preço é 200"));
    }
}
