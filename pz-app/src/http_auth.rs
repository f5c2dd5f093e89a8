use axum::Json;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Bearer token guarding `/api/v1/admin/*`. `None` disables the admin API.
#[derive(Debug, Clone, Default)]
pub struct AdminAuthPolicy {
    pub token: Option<String>,
}

impl AdminAuthPolicy {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdminAuthPolicyExt(pub AdminAuthPolicy);

fn parse_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn tokens_match(provided: &str, expected: &str) -> bool {
    provided.len() == expected.len()
        && provided
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    tracing::warn!(error_code = code, status = status.as_u16(), "admin auth rejected");
    (
        status,
        Json(json!({
            "status": "error",
            "error": message,
            "error_code": code,
        })),
    )
        .into_response()
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn require_admin_token(req: Request<Body>, next: Next) -> Response {
    let policy = req
        .extensions()
        .get::<AdminAuthPolicyExt>()
        .map(|v| v.0.clone())
        .unwrap_or_default();

    let Some(expected) = policy.token.as_deref() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "admin_api_disabled",
            "admin api is disabled; set admin.api_token or PNEUZAP_ADMIN_TOKEN",
        );
    };
    let Some(provided) = parse_bearer_token(req.headers()) else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "missing_bearer_token",
            "missing bearer token",
        );
    };
    if !tokens_match(&provided, expected) {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_bearer_token",
            "invalid bearer token",
        );
    }
    next.run(req).await
}
