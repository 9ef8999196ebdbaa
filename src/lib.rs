//! lapse: a link shortener whose links expire on their own, by date or by
//! click count, and fall back to a secondary URL once they do.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod expiry;
pub mod handlers;
pub mod models;
pub mod plan;
pub mod rate_limit;
pub mod slug;

// ── Shared application state ───────────────────────────────────────────────

/// Everything handlers share. Nothing here is mutable in-process: all shared
/// mutable state (links, counters, activations) lives in the database, which
/// is the sole synchronization point between concurrent requests.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: config::AppConfig,
}

/// Build the application router over shared state. The binary and the
/// integration tests both go through here so they serve the same routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check — 200 OK, no auth
        .route("/health", get(|| async { StatusCode::OK }))
        // Public resolution path
        .route("/r/:slug", get(handlers::redirect::redirect))
        // Owner-scoped lifecycle API
        .route(
            "/links",
            post(handlers::links::create_link).get(handlers::links::list_links),
        )
        .route(
            "/links/:id",
            get(handlers::links::get_link)
                .patch(handlers::links::update_link)
                .delete(handlers::links::delete_link),
        )
        .route("/links/:id/analytics", get(handlers::links::analytics))
        // Plan transitions
        .route("/account/plan", put(handlers::billing::update_plan))
        .route("/billing/webhook", post(handlers::billing::webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
