use crate::feedback::{FeedbackDetails, FeedbackError};
use crate::server::AppState;
use crate::store::FeedbackKind;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_NEGATIVE_LIMIT: usize = 20;
const MAX_NEGATIVE_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateFeedbackRequest {
    conversation_id: Uuid,
    message_id: Uuid,
    kind: FeedbackKind,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    correction: Option<String>,
    #[serde(default)]
    staff_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    #[serde(default)]
    limit: Option<usize>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/admin/feedback", post(create_feedback))
        .route("/api/v1/admin/feedback/stats", get(get_stats))
        .route("/api/v1/admin/feedback/negative", get(list_negative))
        .route("/api/v1/admin/feedback/patterns", get(list_patterns))
        .route("/api/v1/admin/feedback/suggestions", get(list_suggestions))
}

pub(crate) fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %format!("{e:#}"), "admin request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "error": "internal error" })),
    )
        .into_response()
}

fn feedback_error(e: FeedbackError) -> Response {
    let status = match e {
        FeedbackError::MessageNotFound(_) => StatusCode::NOT_FOUND,
        FeedbackError::ConversationMismatch { .. }
        | FeedbackError::NotAiReply(_)
        | FeedbackError::CorrectionRequired => StatusCode::BAD_REQUEST,
        FeedbackError::Store(inner) => return internal_error(inner),
    };
    (status, Json(json!({ "status": "error", "error": e.to_string() }))).into_response()
}

#[tracing::instrument(level = "info", skip_all)]
async fn create_feedback(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<CreateFeedbackRequest>,
) -> Response {
    let details = FeedbackDetails {
        comment: req.comment,
        correction: req.correction,
        staff_id: req.staff_id,
    };
    match state
        .feedback
        .record_feedback(req.conversation_id, req.message_id, req.kind, details)
        .await
    {
        Ok(feedback) => (
            StatusCode::CREATED,
            Json(json!({ "status": "ok", "feedback": feedback })),
        )
            .into_response(),
        Err(e) => feedback_error(e),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_stats(Extension(state): Extension<Arc<AppState>>) -> Response {
    match state.feedback.statistics().await {
        Ok(stats) => Json(json!({ "status": "ok", "stats": stats })).into_response(),
        Err(e) => internal_error(e),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_negative(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_NEGATIVE_LIMIT)
        .clamp(1, MAX_NEGATIVE_LIMIT);
    match state.feedback.recent_negative(limit).await {
        Ok(items) => Json(json!({ "status": "ok", "feedback": items })).into_response(),
        Err(e) => internal_error(e),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_patterns(Extension(state): Extension<Arc<AppState>>) -> Response {
    match state.feedback.mine_correction_patterns().await {
        Ok(patterns) => Json(json!({ "status": "ok", "patterns": patterns })).into_response(),
        Err(e) => internal_error(e),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_suggestions(Extension(state): Extension<Arc<AppState>>) -> Response {
    match state.feedback.generate_suggestions().await {
        Ok(suggestions) => {
            Json(json!({ "status": "ok", "suggestions": suggestions })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::feedback::NOMINAL_PERFORMANCE;
    use crate::routes::tests::{TestApp, admin_request, body_json, test_app};
    use crate::store::{ConversationStore, NewMessage};
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::util::ServiceExt;
    use uuid::Uuid;

    async fn seeded() -> (TestApp, Uuid, Uuid) {
        let app = test_app(Some("admin-token"), None);
        let conv = app
            .store
            .upsert_conversation("5511999990000", "Ana")
            .await
            .expect("conv");
        let reply = app
            .store
            .append_message(NewMessage::outbound(conv.id, "Temos sim", None, true))
            .await
            .expect("reply");
        (app, conv.id, reply.id)
    }

    async fn send(
        app: &TestApp,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let response = app
            .router
            .clone()
            .oneshot(admin_request(method, uri, body))
            .await
            .expect("response");
        let status = response.status();
        (status, body_json(response).await)
    }

    #[tokio::test]
    async fn feedback_can_be_recorded_and_summarized() {
        let (app, conv, reply) = seeded().await;
        for kind in ["positive", "positive", "negative"] {
            let (status, body) = send(
                &app,
                "POST",
                "/api/v1/admin/feedback",
                Some(json!({"conversation_id": conv, "message_id": reply, "kind": kind})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED, "{body}");
        }

        let (status, body) = send(&app, "GET", "/api/v1/admin/feedback/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["total"], 3);
        assert_eq!(body["stats"]["positive_rate"], 66.7);

        let (_, body) = send(&app, "GET", "/api/v1/admin/feedback/negative?limit=5", None).await;
        assert_eq!(body["feedback"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["feedback"][0]["message"]["content"], "Temos sim");

        let (_, body) = send(&app, "GET", "/api/v1/admin/feedback/suggestions", None).await;
        let first = body["suggestions"][0].as_str().unwrap_or_default().to_string();
        assert!(first.contains("66.7%"), "{first}");
        assert_ne!(first, NOMINAL_PERFORMANCE);

        let (status, body) = send(&app, "GET", "/api/v1/admin/feedback/patterns", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["patterns"], json!([]));
    }

    #[tokio::test]
    async fn invalid_feedback_targets_are_rejected() {
        let (app, conv, _) = seeded().await;
        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/admin/feedback",
            Some(json!({"conversation_id": conv, "message_id": Uuid::new_v4(), "kind": "positive"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/admin/feedback",
            Some(json!({"conversation_id": Uuid::new_v4(), "message_id": Uuid::new_v4(), "kind": "loved"})),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn correction_without_text_is_bad_request() {
        let (app, conv, reply) = seeded().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/admin/feedback",
            Some(json!({"conversation_id": conv, "message_id": reply, "kind": "correction"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }
}
