use crate::server::AppState;
use crate::webhook::VerifyOutcome;
use axum::body::Bytes;
use axum::extract::Query;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json};
use pz_channels::{SIGNATURE_HEADER, WebhookPayload, verify_signature};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::Instrument;

pub const WEBHOOK_PATH: &str = "/webhook/whatsapp";

#[derive(Debug, Default, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode", default)]
    mode: String,
    #[serde(rename = "hub.verify_token", default)]
    verify_token: String,
    #[serde(rename = "hub.challenge", default)]
    challenge: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route(WEBHOOK_PATH, get(verify_webhook).post(ingest_webhook))
}

#[tracing::instrument(level = "info", skip_all)]
async fn verify_webhook(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    match state
        .controller
        .verify(&query.mode, &query.verify_token, &query.challenge)
    {
        VerifyOutcome::Accepted(challenge) => {
            tracing::info!("webhook subscription verified");
            (StatusCode::OK, [(CONTENT_TYPE, "text/plain")], challenge).into_response()
        }
        VerifyOutcome::Rejected => {
            tracing::warn!(mode = %query.mode, "webhook verification rejected");
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
    }
}

#[tracing::instrument(level = "info", skip_all, fields(bytes = body.len()))]
async fn ingest_webhook(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.app_secret.as_deref() {
        let provided = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !verify_signature(provided, &body, secret) {
            tracing::warn!("rejecting webhook with invalid signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "error": "invalid signature" })),
            )
                .into_response();
        }
    }

    match serde_json::from_slice::<WebhookPayload>(&body) {
        Ok(payload) => {
            // Runs to completion even if the provider hangs up first.
            let controller = state.controller.clone();
            let delivery =
                tokio::spawn(async move { controller.deliver(&payload).await }.in_current_span());
            match delivery.await {
                Ok(report) => tracing::info!(
                    units = report.units.len(),
                    statuses = report.statuses,
                    failed = report.failed(),
                    ignored = report.ignored,
                    "webhook processed"
                ),
                Err(e) => tracing::error!(error = %e, "webhook delivery task failed"),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "malformed webhook payload ignored");
        }
    }
    Json(json!({ "success": true })).into_response()
}

#[cfg(test)]
mod tests {
    use crate::routes::tests::{TestApp, body_json, body_text, test_app, test_app_with};
    use crate::store::{ConversationStore, Direction};
    use crate::webhook::tests::{HarnessOptions, MockGenerator};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pz_channels::{SIGNATURE_HEADER, sign_payload};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn slow_app(generator_delay: Duration, request_timeout: Duration) -> TestApp {
        test_app_with(
            HarnessOptions {
                generator: MockGenerator {
                    delay: Some(generator_delay),
                    ..Default::default()
                },
                generation_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            None,
            None,
            request_timeout,
        )
    }

    fn batch(count: usize) -> Vec<u8> {
        let messages: Vec<serde_json::Value> = (0..count)
            .map(|i| {
                json!({"from": "5511999990000", "id": format!("wamid.{i}"), "type": "text",
                       "text": {"body": format!("mensagem {i}")}})
            })
            .collect();
        serde_json::to_vec(&json!({
            "object": "whatsapp_business_account",
            "entry": [{"changes": [{"value": {
                "contacts": [{"wa_id": "5511999990000", "profile": {"name": "Ana"}}],
                "messages": messages
            }}]}]
        }))
        .expect("json")
    }

    async fn stored_thread(app: &TestApp) -> Vec<(Direction, String)> {
        let conv = app
            .store
            .find_by_phone("5511999990000")
            .await
            .expect("lookup")
            .expect("conversation");
        app.store
            .recent_messages(conv.id, 100)
            .await
            .expect("messages")
            .into_iter()
            .map(|m| (m.direction, m.content))
            .collect()
    }

    fn verify_uri(token: &str) -> String {
        format!(
            "/webhook/whatsapp?hub.mode=subscribe&hub.verify_token={token}&hub.challenge=1158201444"
        )
    }

    async fn post(app: &TestApp, body: Vec<u8>, signature: Option<String>) -> axum::response::Response {
        let mut req = Request::builder()
            .method("POST")
            .uri("/webhook/whatsapp")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            req = req.header(SIGNATURE_HEADER, sig);
        }
        app.router
            .clone()
            .oneshot(req.body(Body::from(body)).expect("request"))
            .await
            .expect("response")
    }

    #[tokio::test]
    async fn verification_echoes_challenge_or_forbids() {
        let app = test_app(None, None);
        for _ in 0..2 {
            let response = app
                .router
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(verify_uri("verify-me"))
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers()["content-type"].to_str().expect("header"),
                "text/plain"
            );
            assert_eq!(body_text(response).await, "1158201444");
        }

        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(verify_uri("nope"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(response).await, "Forbidden");
    }

    #[tokio::test]
    async fn malformed_json_is_acknowledged() {
        let app = test_app(None, None);
        let response = post(&app, b"{not json".to_vec(), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "success": true }));
    }

    #[tokio::test]
    async fn message_payload_is_processed() {
        let app = test_app(None, None);
        let payload = json!({
            "object": "whatsapp_business_account",
            "entry": [{"changes": [{"value": {
                "contacts": [{"wa_id": "5511999990000", "profile": {"name": "Ana"}}],
                "messages": [{"from": "5511999990000", "id": "wamid.1", "type": "text",
                              "text": {"body": "oi"}}]
            }}]}]
        });
        let response = post(&app, serde_json::to_vec(&payload).expect("json"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "success": true }));
        assert_eq!(app.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(app.provider.texts(), vec!["resposta 0".to_string()]);
    }

    #[tokio::test]
    async fn signature_is_enforced_when_secret_configured() {
        let app = test_app(None, Some("app-secret"));
        let body = br#"{"object":"whatsapp_business_account","entry":[]}"#.to_vec();

        let response = post(&app, body.clone(), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = post(&app, body.clone(), Some(sign_payload(&body, "other"))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let signature = sign_payload(&body, "app-secret");
        let response = post(&app, body, Some(signature)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn slow_batches_are_not_cut_by_the_request_timeout() {
        let app = slow_app(Duration::from_millis(100), Duration::from_millis(150));
        let response = post(&app, batch(4), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "success": true }));

        let thread = stored_thread(&app).await;
        assert_eq!(thread.len(), 8);
        assert!(
            thread
                .chunks(2)
                .all(|pair| pair[0].0 == Direction::Inbound && pair[1].0 == Direction::Outbound)
        );
        assert_eq!(app.generator.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn batch_finishes_after_the_caller_hangs_up() {
        let app = slow_app(Duration::from_millis(50), Duration::from_secs(30));
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), post(&app, batch(3), None)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let thread = stored_thread(&app).await;
        assert_eq!(thread.len(), 6);
        assert_eq!(app.provider.texts().len(), 3);
    }
}
