//! Plan tiers and the enforcement engine that keeps an account's active
//! links inside its cap after every plan transition.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db;
use crate::models::{EndedReason, PlanTier};

/// Links deactivated per enforcement round trip. Bounds the size of any
/// single mutation against large accounts.
const TRIM_BATCH: i64 = 100;

/// What one tier is entitled to. `None` means unbounded.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub max_active_links: Option<i64>,
    pub retention_days: Option<i64>,
}

/// Per-tier entitlements, passed in from configuration so tests can
/// substitute small caps. Defaults mirror the public pricing table.
#[derive(Debug, Clone)]
pub struct PlanPolicy {
    pub free: PlanLimits,
    pub plus: PlanLimits,
    pub pro: PlanLimits,
}

impl Default for PlanPolicy {
    fn default() -> Self {
        Self {
            free: PlanLimits {
                max_active_links: Some(10),
                retention_days: Some(30),
            },
            plus: PlanLimits {
                max_active_links: Some(100),
                retention_days: Some(365),
            },
            pro: PlanLimits {
                max_active_links: None,
                retention_days: None,
            },
        }
    }
}

impl PlanPolicy {
    pub fn limits(&self, tier: PlanTier) -> PlanLimits {
        match tier {
            PlanTier::Free => self.free,
            PlanTier::Plus => self.plus,
            PlanTier::Pro => self.pro,
        }
    }

    pub fn max_active_links(&self, tier: PlanTier) -> Option<i64> {
        self.limits(tier).max_active_links
    }

    pub fn retention_days(&self, tier: PlanTier) -> Option<i64> {
        self.limits(tier).retention_days
    }
}

/// Outcome of one enforcement run.
#[derive(Debug, Clone, Copy)]
pub struct Enforcement {
    /// Links flipped from active to inactive by this run.
    pub trimmed: u64,
}

// ── Enforcement ────────────────────────────────────────────────────────────

/// Persist a user's new plan, then bring their active links inside the new
/// cap. Runs synchronously inside every plan transition, webhook-driven or
/// user-initiated, so the cap invariant holds the moment the transition
/// completes.
pub async fn update_plan_and_enforce(
    pool: &SqlitePool,
    policy: &PlanPolicy,
    user_id: &str,
    new_plan: PlanTier,
    now: DateTime<Utc>,
) -> Result<Enforcement, sqlx::Error> {
    db::set_plan(pool, user_id, new_plan, now).await?;
    enforce_active_link_limit(pool, policy, user_id, new_plan, now).await
}

/// Deactivate the oldest active links until the account fits its cap.
///
/// Oldest-first is the stable, explainable policy: the newest links survive
/// a downgrade. Work proceeds in batches of [`TRIM_BATCH`], each batch one
/// transaction that flips the links off and closes their open activations
/// with `ended_reason = plan_downgrade`. Idempotent: a compliant account
/// trims zero. An empty batch stops the loop even if the initial count said
/// otherwise, so a stale count can never spin.
pub async fn enforce_active_link_limit(
    pool: &SqlitePool,
    policy: &PlanPolicy,
    user_id: &str,
    plan: PlanTier,
    now: DateTime<Utc>,
) -> Result<Enforcement, sqlx::Error> {
    let max = match policy.max_active_links(plan) {
        Some(max) => max,
        None => return Ok(Enforcement { trimmed: 0 }),
    };

    let active = db::count_active_links(pool, user_id).await?;
    if active <= max {
        return Ok(Enforcement { trimmed: 0 });
    }

    let mut remaining = (active - max) as u64;
    let mut trimmed = 0u64;

    while remaining > 0 {
        let batch = remaining.min(TRIM_BATCH as u64) as i64;
        let ids = db::oldest_active_link_ids(pool, user_id, batch).await?;
        if ids.is_empty() {
            break;
        }
        trimmed += db::deactivate_links(pool, &ids, EndedReason::PlanDowngrade, now).await?;
        remaining = remaining.saturating_sub(ids.len() as u64);
    }

    if trimmed > 0 {
        tracing::info!(
            "Plan enforcement deactivated {} link(s) for user {}",
            trimmed,
            user_id
        );
    }

    Ok(Enforcement { trimmed })
}
