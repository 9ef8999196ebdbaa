use anyhow::{Context, Result};
use chrono::Duration;

use crate::plan::PlanPolicy;
use crate::slug::SlugPolicy;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite connection string, e.g. "sqlite:./lapse.db"
    pub database_url: String,

    /// Host to bind the HTTP server to, e.g. "0.0.0.0"
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Public base URL used when rendering short links, e.g. "https://lap.se"
    /// Must NOT have a trailing slash.
    pub base_url: String,

    /// HS256 secret shared with the external identity provider. Bearer
    /// tokens are validated against it; we never mint user tokens ourselves.
    pub jwt_secret: String,

    /// Shared secret the billing collaborator presents on webhook calls.
    pub webhook_secret: String,

    /// Fixed-window limits for the three throttled paths.
    pub rate_limits: RateLimitSettings,

    /// Slug shape rules and the reserved-word set.
    pub slug_policy: SlugPolicy,

    /// Per-tier active-link caps and analytics retention windows.
    pub plan_policy: PlanPolicy,
}

/// Limits for the three fixed-window call sites. All substitutable in tests;
/// the limiter itself is scope-agnostic.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Redirects allowed per client IP per slug per window.
    pub redirect_ip_limit: i64,
    pub redirect_ip_window: Duration,

    /// Aggregate redirects per slug per window, regardless of source.
    pub redirect_slug_limit: i64,
    pub redirect_slug_window: Duration,

    /// Links a single user may create per day.
    pub creation_daily_limit: i64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            redirect_ip_limit: 30,
            redirect_ip_window: Duration::minutes(1),
            redirect_slug_limit: 300,
            redirect_slug_window: Duration::minutes(1),
            creation_daily_limit: 50,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables (populated by dotenvy
    /// before this is called).
    pub fn from_env() -> Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET")
            .context("JWT_SECRET must be set in the environment or .env file")?;
        if jwt_secret.trim().is_empty() {
            anyhow::bail!("JWT_SECRET must not be empty");
        }

        let webhook_secret = std::env::var("BILLING_WEBHOOK_SECRET")
            .context("BILLING_WEBHOOK_SECRET must be set in the environment or .env file")?;
        if webhook_secret.trim().is_empty() {
            anyhow::bail!("BILLING_WEBHOOK_SECRET must not be empty");
        }

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse::<u16>()
            .context("PORT must be a valid port number (1–65535)")?;

        let base_url = std::env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_owned();

        let rate_limits = RateLimitSettings {
            redirect_ip_limit: env_i64("RATE_LIMIT_REDIRECT_IP", 30),
            redirect_ip_window: Duration::seconds(env_i64("RATE_LIMIT_REDIRECT_IP_WINDOW_SECS", 60)),
            redirect_slug_limit: env_i64("RATE_LIMIT_REDIRECT_SLUG", 300),
            redirect_slug_window: Duration::seconds(env_i64(
                "RATE_LIMIT_REDIRECT_SLUG_WINDOW_SECS",
                60,
            )),
            creation_daily_limit: env_i64("RATE_LIMIT_CREATION_DAILY", 50),
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./lapse.db".into()),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port,
            base_url,
            jwt_secret,
            webhook_secret,
            rate_limits,
            slug_policy: SlugPolicy::default(),
            plan_policy: PlanPolicy::default(),
        })
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
