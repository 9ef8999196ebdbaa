use crate::{
    auth::AuthUser,
    billing::{self, BillingEvent},
    db,
    error::AppError,
    models::PlanTier,
    plan,
    AppState,
};
use axum::{extract::State, http::HeaderMap, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct UpdatePlanRequest {
    pub plan: PlanTier,
}

#[derive(Debug, Serialize)]
pub struct PlanChangeResponse {
    pub plan: PlanTier,
    /// Links deactivated to fit the new cap.
    pub trimmed: u64,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
}

/// PUT /account/plan
///
/// User-initiated plan change. Enforcement runs synchronously, so the
/// response already reflects any links trimmed by a downgrade.
pub async fn update_plan(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdatePlanRequest>,
) -> Result<Json<PlanChangeResponse>, AppError> {
    let now = Utc::now();
    db::ensure_profile(&state.db, &auth.user_id, auth.email.as_deref(), now).await?;

    let outcome = plan::update_plan_and_enforce(
        &state.db,
        &state.config.plan_policy,
        &auth.user_id,
        req.plan,
        now,
    )
    .await?;

    Ok(Json(PlanChangeResponse {
        plan: req.plan,
        trimmed: outcome.trimmed,
    }))
}

/// POST /billing/webhook
///
/// Intake for the billing collaborator's events. The shared secret is
/// verified in constant time before the payload is acted on. Unrecognized
/// event kinds and subscription events that match no local account are
/// acknowledged with 200 so the provider stops retrying; only verification
/// and storage failures are non-2xx.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(event): Json<BillingEvent>,
) -> Result<Json<WebhookAck>, AppError> {
    let presented = headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !billing::verify_secret(presented, &state.config.webhook_secret) {
        return Err(AppError::Unauthorized);
    }

    let now = Utc::now();

    let data = match event.subscriber() {
        Some(data) => data,
        None => return Ok(Json(WebhookAck { status: "ignored" })),
    };
    let target = match event.target_plan() {
        Some(plan) => plan,
        None => {
            tracing::warn!("Subscription event without a plan field; acknowledged unchanged");
            return Ok(Json(WebhookAck { status: "ignored" }));
        }
    };

    let user_id = match billing::resolve_user(&state.db, data).await? {
        Some(user_id) => user_id,
        None => {
            tracing::warn!(
                "Billing event matched no account (email {:?}); acknowledged unchanged",
                data.email
            );
            return Ok(Json(WebhookAck { status: "unmatched" }));
        }
    };

    let outcome = plan::update_plan_and_enforce(
        &state.db,
        &state.config.plan_policy,
        &user_id,
        target,
        now,
    )
    .await?;

    tracing::info!(
        "Billing event moved user {} to {:?}, trimming {} link(s)",
        user_id,
        target,
        outcome.trimmed
    );

    Ok(Json(WebhookAck { status: "applied" }))
}
