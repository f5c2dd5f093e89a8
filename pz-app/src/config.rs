//! PneuZap configuration loader.
//!
//! TOML file plus environment overrides. Missing credentials are allowed:
//! the feature that needs them is disabled at startup instead.

use crate::catalog::Product;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PneuzapConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub replies: RepliesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    60
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    /// Shared secret echoed back during the subscription handshake.
    #[serde(default)]
    pub verify_token: String,
    /// When set, inbound POSTs must carry a valid `x-hub-signature-256`.
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_external_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

fn default_external_timeout_seconds() -> u64 {
    20
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            phone_number_id: String::new(),
            verify_token: String::new(),
            app_secret: None,
            api_base: None,
            http_timeout_seconds: default_external_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Number of stored messages handed to the generator as context.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_max_product_images")]
    pub max_product_images: usize,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    "Você é o assistente de vendas de uma loja de pneus seminovos. Responda em português do \
     Brasil, de forma curta, simpática e objetiva. Ajude o cliente a encontrar a medida certa, \
     informe preços e disponibilidade apenas com base no catálogo fornecido e ofereça agendar a \
     instalação. Nunca invente preços ou estoque."
        .to_string()
}

fn default_llm_timeout_seconds() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    600
}

fn default_history_limit() -> usize {
    20
}

fn default_max_product_images() -> usize {
    3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            openai_api_key: None,
            anthropic_api_key: None,
            base_url: None,
            system_prompt: default_system_prompt(),
            timeout_seconds: default_llm_timeout_seconds(),
            max_tokens: default_max_tokens(),
            history_limit: default_history_limit(),
            max_product_images: default_max_product_images(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionConfig {
    /// Falls back to `llm.openai_api_key` when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_transcription_model")]
    pub model: String,
    #[serde(default = "default_transcription_language")]
    pub language: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_external_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_transcription_language() -> String {
    "pt".to_string()
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_transcription_model(),
            language: default_transcription_language(),
            base_url: None,
            timeout_seconds: default_external_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_rate_limit_window_seconds")]
    pub window_seconds: u64,
}

fn default_rate_limit_max_messages() -> usize {
    10
}

fn default_rate_limit_window_seconds() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_messages: default_rate_limit_max_messages(),
            window_seconds: default_rate_limit_window_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandoffConfig {
    /// Replaces the built-in phrase list when non-empty.
    #[serde(default)]
    pub phrases: Vec<String>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            phrases: crate::handoff::DEFAULT_PHRASES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Canned texts sent to customers.
#[derive(Debug, Clone, Deserialize)]
pub struct RepliesConfig {
    #[serde(default = "default_rate_limited")]
    pub rate_limited: String,
    #[serde(default = "default_audio_failed")]
    pub audio_failed: String,
    #[serde(default = "default_audio_unsupported")]
    pub audio_unsupported: String,
    #[serde(default = "default_media_unsupported")]
    pub media_unsupported: String,
    #[serde(default = "default_handoff_ack")]
    pub handoff_ack: String,
    #[serde(default = "default_generation_failed")]
    pub generation_failed: String,
}

fn default_rate_limited() -> String {
    "Você está enviando muitas mensagens seguidas. Aguarde um pouquinho que já te respondo!"
        .to_string()
}

fn default_audio_failed() -> String {
    "Desculpe, não consegui entender seu áudio. Pode digitar sua mensagem, por favor?".to_string()
}

fn default_audio_unsupported() -> String {
    "Desculpe, esse formato de áudio não é suportado. Pode digitar sua mensagem, por favor?"
        .to_string()
}

fn default_media_unsupported() -> String {
    "Ainda não consigo analisar imagens, vídeos ou documentos. Pode me contar por texto o que \
     você precisa?"
        .to_string()
}

fn default_handoff_ack() -> String {
    "Certo! Vou te transferir para um de nossos atendentes. Em instantes alguém da equipe te \
     responde por aqui."
        .to_string()
}

fn default_generation_failed() -> String {
    "Desculpe, tive um probleminha para responder agora. Pode repetir em instantes? Se preferir, \
     digite \"atendente\" para falar com nossa equipe."
        .to_string()
}

impl Default for RepliesConfig {
    fn default() -> Self {
        Self {
            rate_limited: default_rate_limited(),
            audio_failed: default_audio_failed(),
            audio_unsupported: default_audio_unsupported(),
            media_unsupported: default_media_unsupported(),
            handoff_ack: default_handoff_ack(),
            generation_failed: default_generation_failed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "~/.pneuzap/pneuzap.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    /// Bearer token for `/api/v1/admin/*`. Admin routes are disabled when unset.
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub products: Vec<Product>,
}

impl PneuzapConfig {
    /// Loads `path`, or `~/.pneuzap/config.toml` when it exists, else defaults.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (explicit, path) = match path {
            Some(p) => (true, p),
            None => (false, default_config_path()),
        };

        let mut cfg = if explicit || tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
            Self::from_toml(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "no config file found; using defaults");
            Self::default()
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let mut cfg: PneuzapConfig = toml::from_str(contents)?;
        if cfg.handoff.phrases.is_empty() {
            cfg.handoff = HandoffConfig::default();
        }
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        let env = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = env("PNEUZAP_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = env("WHATSAPP_ACCESS_TOKEN") {
            self.whatsapp.access_token = v;
        }
        if let Some(v) = env("WHATSAPP_PHONE_NUMBER_ID") {
            self.whatsapp.phone_number_id = v;
        }
        if let Some(v) = env("WHATSAPP_VERIFY_TOKEN") {
            self.whatsapp.verify_token = v;
        }
        if let Some(v) = env("WHATSAPP_APP_SECRET") {
            self.whatsapp.app_secret = Some(v);
        }
        if let Some(v) = env("PNEUZAP_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(v);
        }
        if let Some(v) = env("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = Some(v);
        }
        if let Some(v) = env("TRANSCRIPTION_API_KEY") {
            self.transcription.api_key = Some(v);
        }
        if let Some(v) = env("PNEUZAP_ADMIN_TOKEN") {
            self.admin.api_token = Some(v);
        }
        if let Some(v) = env("PNEUZAP_DATABASE") {
            if v.eq_ignore_ascii_case(":memory:") {
                self.storage.backend = StorageBackend::Memory;
            } else {
                self.storage.backend = StorageBackend::Sqlite;
                self.storage.path = v;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.whatsapp.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("whatsapp.http_timeout_seconds must be > 0"));
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        if self.llm.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("llm.timeout_seconds must be > 0"));
        }
        if self.llm.history_limit == 0 {
            return Err(anyhow::anyhow!("llm.history_limit must be > 0"));
        }
        if self.transcription.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("transcription.timeout_seconds must be > 0"));
        }
        if self.rate_limit.max_messages == 0 {
            return Err(anyhow::anyhow!("rate_limit.max_messages must be > 0"));
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(anyhow::anyhow!("rate_limit.window_seconds must be > 0"));
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.trim().is_empty() {
            return Err(anyhow::anyhow!("storage.path is required for sqlite storage"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn llm_api_key(&self) -> Option<String> {
        let model = self.llm.model.to_ascii_lowercase();
        let key = if model.starts_with("claude-") {
            self.llm.anthropic_api_key.clone()
        } else {
            self.llm.openai_api_key.clone()
        };
        key.filter(|s| !s.trim().is_empty())
    }

    pub fn transcription_api_key(&self) -> Option<String> {
        self.transcription
            .api_key
            .clone()
            .or_else(|| self.llm.openai_api_key.clone())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn whatsapp_configured(&self) -> bool {
        !self.whatsapp.access_token.trim().is_empty()
            && !self.whatsapp.phone_number_id.trim().is_empty()
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".pneuzap").join("config.toml")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_valid_defaults() {
        let cfg = PneuzapConfig::from_toml("").expect("parse");
        cfg.validate().expect("defaults are valid");
        assert_eq!(cfg.rate_limit.max_messages, 10);
        assert_eq!(cfg.rate_limit.window_seconds, 60);
        assert_eq!(cfg.transcription.language, "pt");
        assert!(!cfg.handoff.phrases.is_empty());
        assert!(cfg.llm_api_key().is_none());
        assert!(!cfg.whatsapp_configured());
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = PneuzapConfig::from_toml(
            r#"
[whatsapp]
access_token = "tok"
phone_number_id = "123"
verify_token = "verify-me"

[llm]
model = "claude-3-5-haiku-latest"
anthropic_api_key = "ak"
openai_api_key = "ok"

[rate_limit]
max_messages = 3
window_seconds = 10

[handoff]
phrases = ["quero humano"]

[storage]
backend = "memory"

[[catalog.products]]
id = "p1"
name = "Pneu Pirelli P4"
size = "175/70R13"
price_cents = 18900
"#,
        )
        .expect("parse");
        cfg.validate().expect("valid");
        assert!(cfg.whatsapp_configured());
        assert_eq!(cfg.llm_api_key().as_deref(), Some("ak"));
        assert_eq!(cfg.transcription_api_key().as_deref(), Some("ok"));
        assert_eq!(cfg.handoff.phrases, vec!["quero humano".to_string()]);
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.catalog.products.len(), 1);
    }

    #[test]
    fn validate_rejects_zero_window() {
        let mut cfg = PneuzapConfig::default();
        cfg.rate_limit.window_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PneuzapConfig::default();
        cfg.server.bind_addr = "not an addr".into();
        assert!(cfg.validate().is_err());
    }
}
