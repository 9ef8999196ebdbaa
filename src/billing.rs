//! Billing-collaborator intake: the webhook event vocabulary, shared-secret
//! verification, and the event-to-account linkage rules.

use serde::Deserialize;
use sqlx::SqlitePool;
use subtle::ConstantTimeEq;

use crate::db;
use crate::models::PlanTier;

/// Subscriber details carried by subscription events. `user_id` is the
/// metadata our checkout flow attaches; `email` is the provider's own record
/// and only a fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionData {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub plan: Option<PlanTier>,
}

/// The webhook events we act on. The provider emits many other kinds
/// (invoices, payment attempts, disputes); all of those deserialize into
/// `Unrecognized` and are acknowledged without side effects.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BillingEvent {
    #[serde(rename = "subscription.active")]
    SubscriptionActive(SubscriptionData),
    #[serde(rename = "subscription.updated")]
    SubscriptionUpdated(SubscriptionData),
    #[serde(rename = "subscription.cancelled")]
    SubscriptionCancelled(SubscriptionData),
    #[serde(other)]
    Unrecognized,
}

impl BillingEvent {
    /// The plan this event moves the subscriber to. Cancellation always
    /// lands on the free tier; active/updated events without a plan field
    /// give `None` and are treated like unrecognized ones.
    pub fn target_plan(&self) -> Option<PlanTier> {
        match self {
            BillingEvent::SubscriptionActive(data) | BillingEvent::SubscriptionUpdated(data) => {
                data.plan
            }
            BillingEvent::SubscriptionCancelled(_) => Some(PlanTier::Free),
            BillingEvent::Unrecognized => None,
        }
    }

    pub fn subscriber(&self) -> Option<&SubscriptionData> {
        match self {
            BillingEvent::SubscriptionActive(data)
            | BillingEvent::SubscriptionUpdated(data)
            | BillingEvent::SubscriptionCancelled(data) => Some(data),
            BillingEvent::Unrecognized => None,
        }
    }
}

/// Constant-time comparison of the presented webhook secret against the
/// configured one.
pub fn verify_secret(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Resolve which local account an event belongs to: explicit `user_id`
/// metadata wins, then a lookup by the profile's unique email. `None` means
/// no account matched; the caller acknowledges the event and logs it.
pub async fn resolve_user(
    pool: &SqlitePool,
    data: &SubscriptionData,
) -> Result<Option<String>, sqlx::Error> {
    if let Some(user_id) = &data.user_id {
        return Ok(Some(user_id.clone()));
    }
    if let Some(email) = &data.email {
        return db::find_user_by_email(pool, email).await;
    }
    Ok(None)
}
