use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a link decides it has expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExpirationMode {
    ByDate,
    ByClicks,
}

/// Why an activation was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EndedReason {
    /// The activation's own rule was satisfied.
    Natural,
    /// Trimmed by plan enforcement after a downgrade.
    PlanDowngrade,
    /// Owner switched the link off by hand.
    Manual,
    /// The parent link was deleted.
    Deleted,
}

/// Subscription tier attached to a profile. Caps and retention windows for
/// each tier live in [`crate::plan::PlanPolicy`], not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Plus,
    Pro,
}

/// A shortened link record from the `links` table.
///
/// `click_count` and `last_clicked_at` are lifetime counters; the counters of
/// the current campaign live on its [`Activation`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Link {
    pub id: String,
    pub slug: String,
    pub owner_id: String,
    pub destination_url: String,
    pub fallback_url: Option<String>,
    pub mode: ExpirationMode,
    pub expires_at: Option<DateTime<Utc>>,
    pub click_limit: Option<i64>,
    pub click_count: i64,
    pub last_clicked_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub current_activation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One bounded life of a link, from creation/reactivation to expiry or
/// deactivation, from the `activations` table. Carries its own copy of the
/// rule and its own counters so history stays meaningful after the link's
/// rule changes.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Activation {
    pub id: String,
    pub link_id: String,
    pub activated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub mode: ExpirationMode,
    pub expires_at: Option<DateTime<Utc>>,
    pub click_limit: Option<i64>,
    pub click_count: i64,
    pub ended_reason: Option<EndedReason>,
}

/// A single resolution hit from the `click_events` table. Append-only.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClickEvent {
    pub id: String,
    pub link_id: String,
    pub clicked_at: DateTime<Utc>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
}

/// Per-user profile row holding the subscription tier. `user_id` is the
/// subject the identity provider puts in bearer tokens; `email` is unique so
/// billing-webhook linkage by email can never be ambiguous.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Profile {
    pub user_id: String,
    pub email: Option<String>,
    pub plan: PlanTier,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
