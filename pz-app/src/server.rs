//! PneuZap HTTP server.
//!
//! Wires config into the webhook controller and feedback service, then mounts
//! the public and admin routers behind the shared tower stack.

use crate::catalog::{ProductCatalog, StaticCatalog};
use crate::config::{PneuzapConfig, StorageBackend, expand_home};
use crate::feedback::FeedbackService;
use crate::handoff::HandoffDetector;
use crate::http_auth::{self, AdminAuthPolicy, AdminAuthPolicyExt};
use crate::locks::ConversationLocks;
use crate::media::{SpeechToText, Transcriber};
use crate::rate_limit::RateLimiter;
use crate::responder::{LlmResponder, ResponseGenerator};
use crate::routes;
use crate::store::{ConversationStore, MemoryStore, SqliteStore};
use crate::webhook::{WebhookController, WebhookDeps};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::{Extension, Router};
use bytes::Bytes;
use pz_channels::{
    MediaId, MediaSource, MessagingProvider, OutboundImage, PhoneNumber, SendReceipt,
    WaMessageId, WhatsAppCloudClient,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Which optional integrations are live. Reported by `/health` and `doctor`.
#[derive(Debug, Clone, Serialize)]
pub struct Features {
    pub whatsapp: bool,
    pub llm: bool,
    pub transcription: bool,
    pub signature_check: bool,
    pub admin_api: bool,
    pub storage: &'static str,
}

impl Features {
    pub fn from_config(cfg: &PneuzapConfig) -> Self {
        Self {
            whatsapp: cfg.whatsapp_configured(),
            llm: cfg.llm_api_key().is_some(),
            transcription: cfg.transcription_api_key().is_some(),
            signature_check: app_secret(cfg).is_some(),
            admin_api: cfg.admin_token().is_some(),
            storage: match cfg.storage.backend {
                StorageBackend::Memory => "memory",
                StorageBackend::Sqlite => "sqlite",
            },
        }
    }
}

pub struct AppState {
    pub controller: Arc<WebhookController>,
    pub feedback: Arc<FeedbackService>,
    pub store: Arc<dyn ConversationStore>,
    /// Enables `x-hub-signature-256` checks on inbound webhooks.
    pub app_secret: Option<String>,
    pub features: Features,
    pub started_at: Instant,
}

/// Used when WhatsApp credentials are missing: inbound messages are still
/// stored, every outbound call fails and is logged by the pipeline.
struct UnconfiguredProvider;

#[async_trait]
impl MessagingProvider for UnconfiguredProvider {
    fn provider_id(&self) -> &str {
        "unconfigured"
    }

    async fn send_text(&self, _to: &PhoneNumber, _body: &str) -> Result<SendReceipt> {
        Err(anyhow!("whatsapp is not configured"))
    }

    async fn send_image(&self, _to: &PhoneNumber, _image: &OutboundImage) -> Result<SendReceipt> {
        Err(anyhow!("whatsapp is not configured"))
    }

    async fn mark_read(&self, _message_id: &WaMessageId) -> Result<()> {
        Err(anyhow!("whatsapp is not configured"))
    }
}

#[async_trait]
impl MediaSource for UnconfiguredProvider {
    async fn fetch_media(&self, _media_id: &MediaId) -> Option<Bytes> {
        None
    }
}

fn app_secret(cfg: &PneuzapConfig) -> Option<String> {
    cfg.whatsapp
        .app_secret
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn build_whatsapp_client(cfg: &PneuzapConfig) -> Result<WhatsAppCloudClient> {
    let client = WhatsAppCloudClient::new(
        &cfg.whatsapp.access_token,
        &cfg.whatsapp.phone_number_id,
        Duration::from_secs(cfg.whatsapp.http_timeout_seconds),
    )?;
    Ok(match cfg.whatsapp.api_base.as_deref() {
        Some(base) => client.with_api_base(base),
        None => client,
    })
}

async fn open_store(cfg: &PneuzapConfig) -> Result<Arc<dyn ConversationStore>> {
    match cfg.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; conversations are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sqlite => {
            let path = expand_home(&cfg.storage.path)?;
            let store = tokio::task::spawn_blocking({
                let path = path.clone();
                move || SqliteStore::open(path)
            })
            .await
            .context("sqlite open task failed")??;
            tracing::info!(path = %path.display(), "sqlite store opened");
            Ok(Arc::new(store))
        }
    }
}

fn build_generator(cfg: &PneuzapConfig) -> Result<Option<Arc<dyn ResponseGenerator>>> {
    let Some(api_key) = cfg.llm_api_key() else {
        tracing::warn!(model = %cfg.llm.model, "no llm api key configured; replies use the canned fallback");
        return Ok(None);
    };
    let mut llm = pz_llm::LlmClient::new(
        &api_key,
        &cfg.llm.model,
        Duration::from_secs(cfg.llm.timeout_seconds),
    )?
    .with_max_tokens(cfg.llm.max_tokens);
    if let Some(base_url) = cfg.llm.base_url.as_deref() {
        llm = llm.with_base_url(base_url);
    }
    let catalog: Arc<dyn ProductCatalog> =
        Arc::new(StaticCatalog::new(cfg.catalog.products.clone()));
    let responder: Arc<dyn ResponseGenerator> = Arc::new(LlmResponder::new(
        llm,
        catalog,
        cfg.llm.system_prompt.clone(),
        cfg.llm.max_product_images,
    ));
    Ok(Some(responder))
}

fn build_speech_to_text(cfg: &PneuzapConfig) -> Result<Option<Arc<dyn SpeechToText>>> {
    let Some(api_key) = cfg.transcription_api_key() else {
        tracing::warn!("no transcription api key configured; voice notes get the audio failure reply");
        return Ok(None);
    };
    let mut client = pz_llm::TranscriptionClient::new(
        &api_key,
        &cfg.transcription.model,
        &cfg.transcription.language,
        Duration::from_secs(cfg.transcription.timeout_seconds),
    )?;
    if let Some(base_url) = cfg.transcription.base_url.as_deref() {
        client = client.with_base_url(base_url);
    }
    let stt: Arc<dyn SpeechToText> = Arc::new(client);
    Ok(Some(stt))
}

/// Builds every runtime component from config.
pub async fn build_state(
    cfg: &PneuzapConfig,
    rate_limiter: Arc<RateLimiter>,
    locks: Arc<ConversationLocks>,
) -> Result<Arc<AppState>> {
    let store = open_store(cfg).await?;

    let (provider, media): (Arc<dyn MessagingProvider>, Arc<dyn MediaSource>) =
        if cfg.whatsapp_configured() {
            let client = Arc::new(build_whatsapp_client(cfg)?);
            let provider: Arc<dyn MessagingProvider> = client.clone();
            let media: Arc<dyn MediaSource> = client;
            (provider, media)
        } else {
            tracing::warn!("whatsapp credentials missing; outbound messages will fail");
            let provider: Arc<dyn MessagingProvider> = Arc::new(UnconfiguredProvider);
            let media: Arc<dyn MediaSource> = Arc::new(UnconfiguredProvider);
            (provider, media)
        };
    if cfg.whatsapp.verify_token.trim().is_empty() {
        tracing::warn!("whatsapp.verify_token is empty; webhook verification will always fail");
    }

    let transcriber = Transcriber::new(
        media,
        build_speech_to_text(cfg)?,
        Duration::from_secs(cfg.transcription.timeout_seconds),
    );
    let controller = Arc::new(WebhookController::new(WebhookDeps {
        verify_token: cfg.whatsapp.verify_token.clone(),
        store: store.clone(),
        provider,
        transcriber,
        rate_limiter,
        locks,
        handoff: HandoffDetector::new(&cfg.handoff.phrases),
        generator: build_generator(cfg)?,
        replies: cfg.replies.clone(),
        history_limit: cfg.llm.history_limit,
        generation_timeout: Duration::from_secs(cfg.llm.timeout_seconds),
    }));

    Ok(Arc::new(AppState {
        controller,
        feedback: Arc::new(FeedbackService::new(store.clone())),
        store,
        app_secret: app_secret(cfg),
        features: Features::from_config(cfg),
        started_at: Instant::now(),
    }))
}

/// Public, webhook and admin routes with request ids and tracing.
///
/// `request_timeout` bounds health and admin requests only. The webhook is
/// never cut short: the provider must always get its 200 and a half-processed
/// batch would be redelivered.
pub fn app_router(
    state: Arc<AppState>,
    admin_policy: AdminAuthPolicy,
    request_timeout: Duration,
) -> Router {
    let admin = routes::admin_router()
        .layer(axum::middleware::from_fn(http_auth::require_admin_token))
        .layer(Extension(AdminAuthPolicyExt(admin_policy)));
    let bounded = routes::router().merge(admin).layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        request_timeout,
    ));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri().path(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::debug!(
                method = %request.method(),
                path = %request.uri().path(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::webhook::router()
        .merge(bounded)
        .layer(Extension(state))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = PneuzapConfig::load(config_path).await?;
    let features = Features::from_config(&cfg);
    tracing::info!(
        bind_addr = %cfg.bind_addr()?,
        model = %cfg.llm.model,
        catalog_products = cfg.catalog.products.len(),
        handoff_phrases = cfg.handoff.phrases.len(),
        rate_limit_max_messages = cfg.rate_limit.max_messages,
        rate_limit_window_seconds = cfg.rate_limit.window_seconds,
        features = ?features,
        "config ok"
    );
    if !features.whatsapp {
        tracing::warn!("whatsapp.access_token / whatsapp.phone_number_id not set");
    }
    if cfg.whatsapp.verify_token.trim().is_empty() {
        tracing::warn!("whatsapp.verify_token not set");
    }
    if !features.llm {
        tracing::warn!(model = %cfg.llm.model, "no api key for the configured model");
    }
    Ok(())
}

fn one_shot_target<'a>(to: &str, message: &'a str) -> Result<(PhoneNumber, &'a str)> {
    let phone = PhoneNumber::normalize(to).ok_or_else(|| anyhow!("invalid phone number {to:?}"))?;
    let message = message.trim();
    if message.is_empty() {
        return Err(anyhow!("message is empty"));
    }
    Ok((phone, message))
}

pub async fn send_one_shot(config_path: Option<PathBuf>, to: &str, message: &str) -> Result<()> {
    let (to, message) = one_shot_target(to, message)?;
    let cfg = PneuzapConfig::load(config_path).await?;
    if !cfg.whatsapp_configured() {
        return Err(anyhow!(
            "whatsapp.access_token and whatsapp.phone_number_id are required to send"
        ));
    }
    let client = build_whatsapp_client(&cfg)?;
    let receipt = client.send_text(&to, message).await?;
    tracing::info!(
        recipient = %to,
        provider_message_id = ?receipt.message_id,
        "one-shot message sent"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = PneuzapConfig::load(config_path).await?;
    let addr = cfg.bind_addr()?;
    let features = Features::from_config(&cfg);
    tracing::info!(
        bind_addr = %addr,
        model = %cfg.llm.model,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        rate_limit_max_messages = cfg.rate_limit.max_messages,
        rate_limit_window_seconds = cfg.rate_limit.window_seconds,
        catalog_products = cfg.catalog.products.len(),
        features = ?features,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let rate_limiter = Arc::new(RateLimiter::new(
        cfg.rate_limit.max_messages,
        Duration::from_secs(cfg.rate_limit.window_seconds),
    ));
    let locks = Arc::new(ConversationLocks::new());
    let state = build_state(&cfg, rate_limiter.clone(), locks.clone()).await?;

    let shutdown = CancellationToken::new();
    let pruner = spawn_pruner(rate_limiter, locks, shutdown.child_token());

    let app = app_router(
        state,
        AdminAuthPolicy::new(cfg.admin_token()),
        Duration::from_secs(cfg.server.http_timeout_seconds),
    )
    .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight));

    tracing::info!(%addr, "pneuzap serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match pruner.await {
        Ok(()) => tracing::info!("pruner shutdown completed"),
        Err(e) => tracing::error!(error = %e, "pruner task join failed during shutdown"),
    }
    Ok(())
}

fn spawn_pruner(
    rate_limiter: Arc<RateLimiter>,
    locks: Arc<ConversationLocks>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    rate_limiter.prune();
                    locks.prune();
                    tracing::debug!(locks = locks.len(), "pruned idle sender state");
                }
            }
        }
    })
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config(extra: &str) -> PneuzapConfig {
        PneuzapConfig::from_toml(&format!("[storage]\nbackend = \"memory\"\n{extra}"))
            .expect("config")
    }

    #[tokio::test]
    async fn state_builds_without_any_credentials() {
        let cfg = memory_config("");
        let state = build_state(
            &cfg,
            Arc::new(RateLimiter::new(10, Duration::from_secs(60))),
            Arc::new(ConversationLocks::new()),
        )
        .await
        .expect("state");
        assert!(!state.features.whatsapp);
        assert!(!state.features.llm);
        assert!(!state.features.transcription);
        assert!(state.app_secret.is_none());
        assert_eq!(state.features.storage, "memory");
    }

    #[test]
    fn blank_app_secret_disables_signature_check() {
        let cfg = memory_config("[whatsapp]\napp_secret = \"  \"\naccess_token = \"t\"\nphone_number_id = \"1\"\n");
        let features = Features::from_config(&cfg);
        assert!(!features.signature_check);
        assert!(features.whatsapp);
    }

    #[tokio::test]
    async fn unconfigured_provider_fails_sends_and_media() {
        let provider = UnconfiguredProvider;
        assert!(
            provider
                .send_text(
                    &PhoneNumber::normalize("5511999990000").expect("phone"),
                    "oi"
                )
                .await
                .is_err()
        );
        assert!(provider.fetch_media(&MediaId::new("m1")).await.is_none());
    }

    #[test]
    fn one_shot_target_normalizes_and_validates() {
        let (phone, message) = one_shot_target("+55 (11) 99999-0000", "  oi  ").expect("target");
        assert_eq!(phone.as_str(), "5511999990000");
        assert_eq!(message, "oi");

        let err = one_shot_target("joao", "oi").expect_err("non-numeric recipient");
        assert!(err.to_string().contains("invalid phone number"), "{err}");
        assert!(one_shot_target("5511999990000", "   ").is_err());
    }

    #[tokio::test]
    async fn send_one_shot_rejects_non_numeric_recipient_before_loading_config() {
        let missing = PathBuf::from("/nonexistent/pneuzap.toml");
        let err = send_one_shot(Some(missing), "not-a-phone", "oi")
            .await
            .expect_err("rejected");
        assert!(err.to_string().contains("invalid phone number"), "{err}");
    }

    #[test]
    fn request_id_defaults_to_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc".parse().expect("header"));
        assert_eq!(request_id_from_headers(&headers), "abc");
    }
}
