pub mod conversations;
pub mod feedback;
pub mod health;
pub mod webhook;

use axum::Router;

/// Public routes other than the provider webhook, which is mounted on its own
/// so it escapes the request timeout.
pub fn router() -> Router {
    Router::new().merge(health::router())
}

/// Staff routes under `/api/v1/admin`, mounted behind the bearer-token guard.
pub fn admin_router() -> Router {
    Router::new()
        .merge(feedback::router())
        .merge(conversations::router())
}
