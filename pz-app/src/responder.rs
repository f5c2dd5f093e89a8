//! Reply generation: the [`ResponseGenerator`] seam and its LLM-backed impl.

use crate::catalog::{self, Product, ProductCatalog};
use crate::store::{Direction, Message};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use pz_llm::{ChatMessage, LlmClient};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_id: Uuid,
    /// Sanitized first name; empty means greet generically.
    pub contact_name: String,
    pub message: String,
    pub sender: String,
    /// Stored thread, oldest first. Includes the message being answered.
    pub history: Vec<Message>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedReply {
    pub text: String,
    /// Sent as images before the text.
    pub product_images: Vec<Product>,
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedReply>;
}

pub struct LlmResponder {
    llm: LlmClient,
    catalog: Arc<dyn ProductCatalog>,
    system_prompt: String,
    max_product_images: usize,
}

impl LlmResponder {
    pub fn new(
        llm: LlmClient,
        catalog: Arc<dyn ProductCatalog>,
        system_prompt: impl Into<String>,
        max_product_images: usize,
    ) -> Self {
        Self {
            llm,
            catalog,
            system_prompt: system_prompt.into(),
            max_product_images,
        }
    }

    fn matching_products(&self, text: &str) -> Vec<Product> {
        catalog::extract_tire_size(text)
            .map(|size| self.catalog.find_by_size(&size))
            .unwrap_or_default()
    }

    fn build_messages(&self, request: &GenerationRequest, products: &[Product]) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(system_prompt(
            &self.system_prompt,
            &request.contact_name,
            products,
        ))];
        messages.extend(history_to_chat(&request.history, &request.message));
        messages
    }
}

#[async_trait]
impl ResponseGenerator for LlmResponder {
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(conversation_id = %request.conversation_id, sender = %request.sender, model = %self.llm.model())
    )]
    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedReply> {
        let products = self.matching_products(&request.message);
        let messages = self.build_messages(&request, &products);

        let response = self.llm.chat(&messages).await.context("llm chat")?;
        let text = response.message.content.trim().to_string();
        if text.is_empty() {
            return Err(anyhow!("llm returned an empty reply"));
        }
        tracing::debug!(
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            products = products.len(),
            "reply generated"
        );

        let product_images = if catalog::asks_for_photos(&request.message) {
            products
                .into_iter()
                .filter(|p| p.image_url.as_deref().is_some_and(|u| !u.trim().is_empty()))
                .take(self.max_product_images)
                .collect()
        } else {
            Vec::new()
        };

        Ok(GeneratedReply {
            text,
            product_images,
        })
    }
}

fn system_prompt(persona: &str, contact_name: &str, products: &[Product]) -> String {
    let mut prompt = persona.trim().to_string();
    prompt.push_str("\n\n");
    if contact_name.is_empty() {
        prompt.push_str(
            "O nome do cliente é desconhecido. Cumprimente de forma genérica e não invente um nome.",
        );
    } else {
        prompt.push_str(&format!("O cliente se chama {contact_name}."));
    }

    if !products.is_empty() {
        prompt.push_str("\n\nProdutos disponíveis para a medida mencionada:\n");
        for p in products {
            prompt.push_str(&format!("- {} ({}) por {}\n", p.name, p.size, p.display_price()));
        }
    }
    prompt
}

/// Maps the stored thread to chat turns.
///
/// Leading assistant turns are dropped so the conversation starts with the
/// customer, and the current message is appended when the history does not
/// already end with it.
fn history_to_chat(history: &[Message], current: &str) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = history
        .iter()
        .skip_while(|m| m.direction == Direction::Outbound)
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| match m.direction {
            Direction::Inbound => ChatMessage::user(m.content.clone()),
            Direction::Outbound => ChatMessage::assistant(m.content.clone()),
        })
        .collect();

    let ends_with_current = history
        .last()
        .is_some_and(|m| m.direction == Direction::Inbound && m.content == current);
    if !ends_with_current {
        out.push(ChatMessage::user(current.to_string()));
    }
    out
}
