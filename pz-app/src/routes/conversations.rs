use crate::routes::feedback::internal_error;
use crate::server::AppState;
use crate::store::ConversationMode;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    #[serde(default)]
    limit: Option<usize>,
}

impl LimitQuery {
    fn resolved(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SetModeRequest {
    mode: ConversationMode,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/admin/conversations", get(list_conversations))
        .route(
            "/api/v1/admin/conversations/{id}/messages",
            get(list_messages),
        )
        .route("/api/v1/admin/conversations/{id}/mode", post(set_mode))
}

fn conversation_not_found(id: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": "error", "error": format!("conversation {id} not found") })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_conversations(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.store.list_conversations(query.resolved()).await {
        Ok(conversations) => {
            Json(json!({ "status": "ok", "conversations": conversations })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(conversation_id = %id))]
async fn list_messages(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let conversation = match state.store.get_conversation(id).await {
        Ok(Some(conversation)) => conversation,
        Ok(None) => return conversation_not_found(id),
        Err(e) => return internal_error(e),
    };
    match state.store.recent_messages(id, query.resolved()).await {
        Ok(messages) => Json(json!({
            "status": "ok",
            "conversation": conversation,
            "messages": messages,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

#[tracing::instrument(level = "info", skip_all, fields(conversation_id = %id))]
async fn set_mode(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<SetModeRequest>,
) -> Response {
    match state.controller.set_mode(id, req.mode).await {
        Ok(Some(conversation)) => {
            Json(json!({ "status": "ok", "conversation": conversation })).into_response()
        }
        Ok(None) => conversation_not_found(id),
        Err(e) => internal_error(e),
    }
}
