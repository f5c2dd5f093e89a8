//! Staff feedback on bot replies and the improvement suggestions derived from it.

use crate::store::{
    Conversation, ConversationStore, Direction, Feedback, FeedbackKind, Message, NewFeedback,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Returned alone when nothing needs attention.
pub const NOMINAL_PERFORMANCE: &str =
    "O assistente está com desempenho dentro do esperado. Continue registrando feedback.";

const APPROVAL_THRESHOLD: f64 = 70.0;
const PATTERN_THRESHOLD: usize = 3;
const MAX_PATTERN_EXAMPLES: usize = 3;

/// Checked in order; the first bucket with a matching keyword wins. Keywords
/// padded with spaces only match whole words.
const CORRECTION_BUCKETS: &[(&str, &[&str])] = &[
    (
        "pricing",
        &["preço", "preco", "valor", "custa", "r$", "caro", "barato", "desconto", "reais"],
    ),
    (
        "sizing",
        &["medida", " aro ", "tamanho", "largura", "perfil", "serve no", "serve pro"],
    ),
    (
        "stock",
        &["estoque", "disponív", "disponiv", "esgotad", "acabou", "em falta", "não temos", "nao temos"],
    ),
    (
        "scheduling",
        &["agend", "horário", "horario", "instalação", "instalacao", "montagem", "amanhã", "amanha"],
    ),
];
const OTHER_BUCKET: &str = "other";

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("message {0} not found")]
    MessageNotFound(Uuid),
    #[error("message {message_id} does not belong to conversation {conversation_id}")]
    ConversationMismatch {
        message_id: Uuid,
        conversation_id: Uuid,
    },
    #[error("message {0} is not an AI-generated reply")]
    NotAiReply(Uuid),
    #[error("correction feedback requires correction text")]
    CorrectionRequired,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackDetails {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub correction: Option<String>,
    #[serde(default)]
    pub staff_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub total: usize,
    pub positive: usize,
    pub negative: usize,
    pub correction: usize,
    /// Percentage, one decimal.
    pub positive_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NegativeFeedbackView {
    pub feedback: Feedback,
    pub message: Option<Message>,
    pub conversation: Option<Conversation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrectionPattern {
    pub pattern: String,
    pub occurrences: usize,
    pub examples: Vec<String>,
}

pub struct FeedbackService {
    store: Arc<dyn ConversationStore>,
}

impl FeedbackService {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    #[tracing::instrument(level = "info", skip(self, details))]
    pub async fn record_feedback(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        kind: FeedbackKind,
        details: FeedbackDetails,
    ) -> Result<Feedback, FeedbackError> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or(FeedbackError::MessageNotFound(message_id))?;
        if message.conversation_id != conversation_id {
            return Err(FeedbackError::ConversationMismatch {
                message_id,
                conversation_id,
            });
        }
        if message.direction != Direction::Outbound || !message.processed_by_ai {
            return Err(FeedbackError::NotAiReply(message_id));
        }

        let correction = non_blank(details.correction);
        if kind == FeedbackKind::Correction && correction.is_none() {
            return Err(FeedbackError::CorrectionRequired);
        }

        let feedback = self
            .store
            .insert_feedback(NewFeedback {
                conversation_id,
                message_id,
                kind,
                comment: non_blank(details.comment),
                correction,
                staff_id: non_blank(details.staff_id),
            })
            .await?;
        tracing::info!(feedback_id = %feedback.id, kind = kind.as_str(), "feedback recorded");
        Ok(feedback)
    }

    pub async fn statistics(&self) -> anyhow::Result<FeedbackStats> {
        Ok(stats_for(&self.store.list_feedback().await?))
    }

    /// Negative feedback, newest first, with the rated reply and its conversation.
    pub async fn recent_negative(&self, limit: usize) -> anyhow::Result<Vec<NegativeFeedbackView>> {
        let negatives: Vec<Feedback> = self
            .store
            .list_feedback()
            .await?
            .into_iter()
            .filter(|f| f.kind == FeedbackKind::Negative)
            .take(limit)
            .collect();

        let mut out = Vec::with_capacity(negatives.len());
        for feedback in negatives {
            let message = self.store.get_message(feedback.message_id).await?;
            let conversation = self.store.get_conversation(feedback.conversation_id).await?;
            out.push(NegativeFeedbackView {
                feedback,
                message,
                conversation,
            });
        }
        Ok(out)
    }

    pub async fn mine_correction_patterns(&self) -> anyhow::Result<Vec<CorrectionPattern>> {
        Ok(patterns_for(&self.store.list_feedback().await?))
    }

    pub async fn generate_suggestions(&self) -> anyhow::Result<Vec<String>> {
        let feedback = self.store.list_feedback().await?;
        Ok(suggestions_for(&stats_for(&feedback), &patterns_for(&feedback)))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn stats_for(feedback: &[Feedback]) -> FeedbackStats {
    let count = |kind: FeedbackKind| feedback.iter().filter(|f| f.kind == kind).count();
    let total = feedback.len();
    let positive = count(FeedbackKind::Positive);
    let positive_rate = if total == 0 {
        0.0
    } else {
        (positive as f64 / total as f64 * 1000.0).round() / 10.0
    };
    FeedbackStats {
        total,
        positive,
        negative: count(FeedbackKind::Negative),
        correction: count(FeedbackKind::Correction),
        positive_rate,
    }
}

fn bucket_for(text: &str) -> &'static str {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '$' { c } else { ' ' })
        .collect();
    let padded = format!(" {} ", cleaned.split_whitespace().collect::<Vec<_>>().join(" "));
    CORRECTION_BUCKETS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| padded.contains(k)))
        .map(|(name, _)| *name)
        .unwrap_or(OTHER_BUCKET)
}

fn patterns_for(feedback: &[Feedback]) -> Vec<CorrectionPattern> {
    let mut patterns: Vec<CorrectionPattern> = Vec::new();
    for f in feedback.iter().filter(|f| f.kind == FeedbackKind::Correction) {
        let Some(text) = f.correction.as_deref().or(f.comment.as_deref()) else {
            continue;
        };
        let bucket = bucket_for(text);
        let idx = match patterns.iter().position(|p| p.pattern == bucket) {
            Some(idx) => idx,
            None => {
                patterns.push(CorrectionPattern {
                    pattern: bucket.to_string(),
                    occurrences: 0,
                    examples: Vec::new(),
                });
                patterns.len() - 1
            }
        };
        let pattern = &mut patterns[idx];
        pattern.occurrences += 1;
        if pattern.examples.len() < MAX_PATTERN_EXAMPLES {
            pattern.examples.push(text.to_string());
        }
    }
    patterns.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
    patterns
}

fn suggestions_for(stats: &FeedbackStats, patterns: &[CorrectionPattern]) -> Vec<String> {
    let mut out = Vec::new();
    if stats.total > 0 && stats.positive_rate < APPROVAL_THRESHOLD {
        out.push(format!(
            "A taxa de aprovação está em {:.1}%, abaixo da meta de {APPROVAL_THRESHOLD:.0}%. \
             Revise as respostas avaliadas como negativas e ajuste o prompt do assistente.",
            stats.positive_rate
        ));
    }
    for pattern in patterns.iter().filter(|p| p.occurrences >= PATTERN_THRESHOLD) {
        let area = match pattern.pattern.as_str() {
            "pricing" => "preços",
            "sizing" => "medidas de pneus",
            "stock" => "disponibilidade de estoque",
            "scheduling" => "agendamento de instalação",
            _ => "outros assuntos",
        };
        out.push(format!(
            "{} correções sobre {area}. Revise as informações do catálogo e as instruções do \
             assistente sobre esse tema.",
            pattern.occurrences
        ));
    }
    if out.is_empty() {
        out.push(NOMINAL_PERFORMANCE.to_string());
    }
    out
}
