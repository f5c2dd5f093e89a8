//! Text-generation and speech-to-text clients for PneuZap.
//!
//! Pure HTTP clients; nothing here knows about WhatsApp or conversations.

mod anthropic;
mod client;
mod error;
mod openai;
mod transcription;
mod types;

pub use client::{LlmClient, Provider};
pub use error::{LlmError, Result};
pub use transcription::TranscriptionClient;
pub use types::{ChatMessage, ChatResponse, Role, Usage};
