use super::{
    Conversation, ConversationMode, ConversationStatus, ConversationStore, Feedback, Message,
    NewFeedback, NewMessage,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Process-local store. Used for tests and `storage.backend = "memory"`.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<Uuid, Conversation>,
    by_phone: HashMap<String, Uuid>,
    messages: HashMap<Uuid, Vec<Message>>,
    message_index: HashMap<Uuid, (Uuid, usize)>,
    feedback: Vec<Feedback>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn upsert_conversation(&self, phone: &str, contact_name: &str) -> Result<Conversation> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        if let Some(id) = state.by_phone.get(phone).copied() {
            let conv = state
                .conversations
                .get_mut(&id)
                .ok_or_else(|| anyhow!("phone index points at missing conversation {id}"))?;
            if !contact_name.is_empty() && conv.contact_name != contact_name {
                conv.contact_name = contact_name.to_string();
                conv.updated_at = now;
            }
            return Ok(conv.clone());
        }

        let conv = Conversation {
            id: Uuid::new_v4(),
            phone: phone.to_string(),
            contact_name: contact_name.to_string(),
            status: ConversationStatus::Active,
            mode: ConversationMode::Bot,
            message_count: 0,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        state.by_phone.insert(phone.to_string(), conv.id);
        state.conversations.insert(conv.id, conv.clone());
        Ok(conv)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.state.read().await.conversations.get(&id).cloned())
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<Conversation>> {
        let state = self.state.read().await;
        Ok(state
            .by_phone
            .get(phone)
            .and_then(|id| state.conversations.get(id))
            .cloned())
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let state = self.state.read().await;
        let mut out: Vec<Conversation> = state.conversations.values().cloned().collect();
        out.sort_by_key(|c| c.last_message_at.unwrap_or(c.created_at));
        out.reverse();
        out.truncate(limit);
        Ok(out)
    }

    async fn set_mode(&self, id: Uuid, mode: ConversationMode) -> Result<Option<Conversation>> {
        let mut state = self.state.write().await;
        let Some(conv) = state.conversations.get_mut(&id) else {
            return Ok(None);
        };
        conv.mode = mode;
        conv.updated_at = Utc::now();
        Ok(Some(conv.clone()))
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message> {
        let mut state = self.state.write().await;
        let state = &mut *state;
        let conv = state
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| anyhow!("unknown conversation {}", message.conversation_id))?;

        // Clock steps backwards must not reorder the thread.
        let now = Utc::now();
        let created_at = conv.last_message_at.map_or(now, |last| last.max(now));

        let stored = Message {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            direction: message.direction,
            content: message.content,
            provider_message_id: message.provider_message_id,
            processed_by_ai: message.processed_by_ai,
            created_at,
        };
        conv.message_count += 1;
        conv.last_message_at = Some(created_at);
        conv.updated_at = created_at;

        let thread = state.messages.entry(stored.conversation_id).or_default();
        state
            .message_index
            .insert(stored.id, (stored.conversation_id, thread.len()));
        thread.push(stored.clone());
        Ok(stored)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let state = self.state.read().await;
        Ok(state
            .message_index
            .get(&id)
            .and_then(|(conv_id, idx)| state.messages.get(conv_id)?.get(*idx))
            .cloned())
    }

    async fn recent_messages(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let Some(thread) = state.messages.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        let start = thread.len().saturating_sub(limit);
        Ok(thread[start..].to_vec())
    }

    async fn insert_feedback(&self, feedback: NewFeedback) -> Result<Feedback> {
        let stored = Feedback {
            id: Uuid::new_v4(),
            conversation_id: feedback.conversation_id,
            message_id: feedback.message_id,
            kind: feedback.kind,
            comment: feedback.comment,
            correction: feedback.correction,
            staff_id: feedback.staff_id,
            created_at: Utc::now(),
        };
        self.state.write().await.feedback.push(stored.clone());
        Ok(stored)
    }

    async fn list_feedback(&self) -> Result<Vec<Feedback>> {
        let state = self.state.read().await;
        Ok(state.feedback.iter().rev().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::store::contract;

    #[tokio::test]
    async fn one_conversation_per_phone() {
        contract::one_conversation_per_phone(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn messages_are_append_only_and_ordered() {
        contract::messages_are_append_only_and_ordered(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn mode_and_feedback_round_trip() {
        contract::mode_and_feedback_round_trip(&MemoryStore::new()).await;
    }
}
