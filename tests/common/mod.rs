#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{self, Request},
    response::Response,
    Router,
};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use lapse::{
    auth::Claims,
    config::{AppConfig, RateLimitSettings},
    plan::{PlanLimits, PlanPolicy},
    router,
    slug::SlugPolicy,
    AppState,
};

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

/// In-memory database with the schema applied. A single connection keeps
/// every query on the same memory database.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Config with deliberately small plan caps (free allows 2 active links) and
/// throttles high enough to stay out of the way; tests that exercise the
/// throttles swap in their own numbers.
pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        host: "127.0.0.1".into(),
        port: 0,
        base_url: "http://short.test".into(),
        jwt_secret: JWT_SECRET.into(),
        webhook_secret: WEBHOOK_SECRET.into(),
        rate_limits: RateLimitSettings {
            redirect_ip_limit: 1000,
            redirect_ip_window: Duration::minutes(1),
            redirect_slug_limit: 1000,
            redirect_slug_window: Duration::minutes(1),
            creation_daily_limit: 1000,
        },
        slug_policy: SlugPolicy::default(),
        plan_policy: PlanPolicy {
            free: PlanLimits {
                max_active_links: Some(2),
                retention_days: Some(30),
            },
            plus: PlanLimits {
                max_active_links: Some(5),
                retention_days: Some(365),
            },
            pro: PlanLimits {
                max_active_links: None,
                retention_days: None,
            },
        },
    }
}

pub async fn test_app() -> (Router, SqlitePool) {
    test_app_with(test_config()).await
}

pub async fn test_app_with(config: AppConfig) -> (Router, SqlitePool) {
    let pool = test_pool().await;
    let state = Arc::new(AppState {
        db: pool.clone(),
        config,
    });
    (router(state), pool)
}

// ── Tokens ─────────────────────────────────────────────────────────────────

pub fn bearer(user_id: &str) -> String {
    bearer_with_email(user_id, None)
}

pub fn bearer_with_email(user_id: &str, email: Option<&str>) -> String {
    let claims = Claims {
        sub: user_id.to_owned(),
        email: email.map(str::to_owned),
        exp: (Utc::now() + Duration::hours(1)).timestamp() as usize,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {token}")
}

// ── Requests ───────────────────────────────────────────────────────────────

/// The router is normally served with connect-info; oneshot requests carry
/// the peer address as an extension instead.
fn with_peer(mut request: Request<Body>) -> Request<Body> {
    let addr: SocketAddr = "203.0.113.9:4444".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

pub fn get(uri: &str) -> Request<Body> {
    with_peer(
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
}

/// GET carrying a forwarded client IP, for exercising the per-IP throttle.
pub fn get_from(uri: &str, ip: &str) -> Request<Body> {
    with_peer(
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap(),
    )
}

pub fn authed(method: &str, uri: &str, auth: &str) -> Request<Body> {
    with_peer(
        Request::builder()
            .method(method)
            .uri(uri)
            .header(http::header::AUTHORIZATION, auth)
            .body(Body::empty())
            .unwrap(),
    )
}

pub fn json_request(method: &str, uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(http::header::AUTHORIZATION, auth);
    }
    with_peer(builder.body(Body::from(body.to_string())).unwrap())
}

// ── Responses ──────────────────────────────────────────────────────────────

pub async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn location(response: &Response) -> Option<String> {
    response
        .headers()
        .get(http::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}
