use crate::{
    auth::AuthUser,
    db,
    error::{self, AppError},
    expiry,
    models::{Activation, ClickEvent, EndedReason, ExpirationMode, Link},
    rate_limit::{self, Scope},
    AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

// ── Request / response types ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    pub destination_url: String,
    pub fallback_url: Option<String>,
    pub mode: ExpirationMode,
    pub expires_at: Option<DateTime<Utc>>,
    pub click_limit: Option<i64>,
    pub slug: Option<String>,
}

/// Partial update. Omitted fields stay as they are; `fallback_url` takes an
/// explicit `null` to clear; `slug: ""` asks for a fresh random slug;
/// `is_active: false` switches the link off; `reactivate: true` revives an
/// expired link under a fresh rule.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateLinkRequest {
    pub destination_url: Option<String>,
    #[serde(default)]
    pub fallback_url: Option<Option<String>>,
    pub slug: Option<String>,
    pub mode: Option<ExpirationMode>,
    pub expires_at: Option<DateTime<Utc>>,
    pub click_limit: Option<i64>,
    pub is_active: Option<bool>,
    #[serde(default)]
    pub reactivate: bool,
}

impl UpdateLinkRequest {
    fn has_field_edits(&self) -> bool {
        self.destination_url.is_some()
            || self.fallback_url.is_some()
            || self.slug.is_some()
            || self.mode.is_some()
            || self.expires_at.is_some()
            || self.click_limit.is_some()
    }
}

#[derive(Debug, Serialize)]
pub struct LinkResponse {
    pub id: String,
    pub slug: String,
    pub short_url: String,
    pub destination_url: String,
    pub fallback_url: Option<String>,
    pub mode: ExpirationMode,
    pub expires_at: Option<DateTime<Utc>>,
    pub click_limit: Option<i64>,
    pub click_count: i64,
    pub remaining_clicks: Option<i64>,
    pub last_clicked_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LinkResponse {
    fn from_link(link: &Link, base_url: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: link.id.clone(),
            slug: link.slug.clone(),
            short_url: format!("{}/r/{}", base_url, link.slug),
            destination_url: link.destination_url.clone(),
            fallback_url: link.fallback_url.clone(),
            mode: link.mode,
            expires_at: link.expires_at,
            click_limit: link.click_limit,
            click_count: link.click_count,
            remaining_clicks: expiry::remaining_clicks(link),
            last_clicked_at: link.last_clicked_at,
            is_active: link.is_active,
            is_expired: expiry::link_expired(link, now),
            created_at: link.created_at,
            updated_at: link.updated_at,
        }
    }
}

/// One row of a "top N" breakdown: value, hits, share of the considered set.
#[derive(Debug, Serialize)]
pub struct BreakdownRow {
    pub name: String,
    pub count: i64,
    pub pct: i64,
}

/// An activation as analytics reports it: the stored row plus its rule
/// evaluated at request time. A date-expired campaign stays open in storage
/// until the next lifecycle write, and `is_expired` is where that shows.
#[derive(Debug, Serialize)]
pub struct ActivationView {
    #[serde(flatten)]
    pub activation: Activation,
    pub is_expired: bool,
}

#[derive(Debug, Serialize)]
pub struct AnalyticsResponse {
    pub link: LinkResponse,
    pub total_clicks: i64,
    pub activations: Vec<ActivationView>,
    pub recent_clicks: Vec<ClickEvent>,
    pub top_browsers: Vec<BreakdownRow>,
    pub top_devices: Vec<BreakdownRow>,
    pub top_referrers: Vec<BreakdownRow>,
}

// ── Handlers ───────────────────────────────────────────────────────────────

/// POST /links
///
/// Validates the URLs, the expiration rule, and any custom slug up front,
/// so a 400 never consumes the daily creation budget; then the plan cap,
/// then the budget, then the insert with its first activation. Custom slugs
/// collide as a 409; generated ones quietly retry.
pub async fn create_link(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateLinkRequest>,
) -> Result<impl IntoResponse, AppError> {
    let now = Utc::now();
    let plan = db::ensure_profile(&state.db, &auth.user_id, auth.email.as_deref(), now).await?;

    let destination_url = validate_url(&req.destination_url, "destination_url")?;
    let fallback_url = match &req.fallback_url {
        Some(url) => Some(validate_url(url, "fallback_url")?),
        None => None,
    };
    let (expires_at, click_limit) =
        validate_rule(req.mode, req.expires_at, req.click_limit, now)?;
    let custom_slug = match req.slug.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(custom) => {
            state.config.slug_policy.validate_custom(custom)?;
            Some(custom)
        }
        None => None,
    };

    if let Some(max) = state.config.plan_policy.max_active_links(plan) {
        let active = db::count_active_links(&state.db, &auth.user_id).await?;
        if active >= max {
            return Err(AppError::PlanCap(format!(
                "your plan allows {max} active link(s); deactivate one or upgrade"
            )));
        }
    }

    let quota = rate_limit::allow_and_increment(
        &state.db,
        Scope::CreateLink,
        &auth.user_id,
        state.config.rate_limits.creation_daily_limit,
        Duration::days(1),
        now,
    )
    .await?;
    if !quota.allowed {
        return Err(AppError::RateLimited {
            retry_after: quota.retry_after_secs(now),
        });
    }

    let link = match custom_slug {
        Some(custom) => {
            match db::create_link(
                &state.db,
                db::NewLink {
                    slug: custom,
                    owner_id: &auth.user_id,
                    destination_url: &destination_url,
                    fallback_url: fallback_url.as_deref(),
                    mode: req.mode,
                    expires_at,
                    click_limit,
                },
                now,
            )
            .await
            {
                Ok(link) => link,
                Err(e) if error::is_unique_violation(&e) => {
                    return Err(AppError::Conflict(format!(
                        "slug \"{custom}\" is already taken"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        None => {
            insert_with_generated_slug(
                &state,
                &auth,
                &destination_url,
                fallback_url.as_deref(),
                req.mode,
                expires_at,
                click_limit,
                now,
            )
            .await?
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(LinkResponse::from_link(&link, &state.config.base_url, now)),
    ))
}

/// GET /links
pub async fn list_links(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<LinkResponse>>, AppError> {
    let now = Utc::now();
    let links = db::list_links_for_owner(&state.db, &auth.user_id).await?;
    Ok(Json(
        links
            .iter()
            .map(|link| LinkResponse::from_link(link, &state.config.base_url, now))
            .collect(),
    ))
}

/// GET /links/:id
pub async fn get_link(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<LinkResponse>, AppError> {
    let now = Utc::now();
    let link = load_owned(&state, &id, &auth).await?;
    Ok(Json(LinkResponse::from_link(
        &link,
        &state.config.base_url,
        now,
    )))
}

/// PATCH /links/:id
///
/// Three mutually exclusive shapes:
/// - `reactivate: true` plus a fresh rule revives an expired link;
/// - `is_active: false` on its own switches a link off;
/// - otherwise a partial edit of a live link's fields. Editing an expired
///   link is refused with a 409 pointing at reactivation.
pub async fn update_link(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateLinkRequest>,
) -> Result<Json<LinkResponse>, AppError> {
    let now = Utc::now();
    let link = load_owned(&state, &id, &auth).await?;

    if req.reactivate {
        let revived = reactivate(&state, &link, &req, now).await?;
        return Ok(Json(LinkResponse::from_link(
            &revived,
            &state.config.base_url,
            now,
        )));
    }

    if req.is_active == Some(true) {
        return Err(AppError::Validation(
            "links cannot be switched back on directly; use reactivate with a fresh rule".into(),
        ));
    }

    if req.is_active == Some(false) {
        if req.has_field_edits() {
            return Err(AppError::Validation(
                "turning a link off accepts no other changes".into(),
            ));
        }
        db::deactivate_links(&state.db, &[link.id.clone()], EndedReason::Manual, now).await?;
        let link = db::get_link_by_id(&state.db, &link.id)
            .await?
            .ok_or(AppError::NotFound("link"))?;
        return Ok(Json(LinkResponse::from_link(
            &link,
            &state.config.base_url,
            now,
        )));
    }

    if expiry::link_expired(&link, now) {
        return Err(AppError::Conflict(
            "link has expired; reactivate it to make changes".into(),
        ));
    }

    let destination_url = match &req.destination_url {
        Some(url) => validate_url(url, "destination_url")?,
        None => link.destination_url.clone(),
    };
    let fallback_url = match &req.fallback_url {
        Some(Some(url)) => Some(validate_url(url, "fallback_url")?),
        Some(None) => None,
        None => link.fallback_url.clone(),
    };
    let slug = match req.slug.as_deref().map(str::trim) {
        // Empty string is the regenerate signal; leaving the field out keeps
        // the current slug.
        Some("") => state.config.slug_policy.generate(),
        Some(custom) => {
            state.config.slug_policy.validate_custom(custom)?;
            custom.to_owned()
        }
        None => link.slug.clone(),
    };

    let mode = req.mode.unwrap_or(link.mode);
    let (expires_at, click_limit) = resolve_rule_edit(&link, mode, &req, now)?;

    let changes = db::LinkChanges {
        slug: &slug,
        destination_url: &destination_url,
        fallback_url: fallback_url.as_deref(),
        mode,
        expires_at,
        click_limit,
    };

    let updated = match db::update_link(&state.db, &link.id, changes, now).await {
        Ok(Some(link)) => link,
        Ok(None) => return Err(AppError::NotFound("link")),
        Err(e) if error::is_unique_violation(&e) => {
            return Err(AppError::Conflict(format!("slug \"{slug}\" is already taken")));
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Json(LinkResponse::from_link(
        &updated,
        &state.config.base_url,
        now,
    )))
}

/// DELETE /links/:id
pub async fn delete_link(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let now = Utc::now();
    let link = load_owned(&state, &id, &auth).await?;
    if db::delete_link(&state.db, &link.id, now).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("link"))
    }
}

/// GET /links/:id/analytics
///
/// Lifetime counters, the full activation history, and the recent click
/// events within the owner's plan retention window, with small top-N
/// breakdowns computed over those events.
pub async fn analytics(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AnalyticsResponse>, AppError> {
    let now = Utc::now();
    let link = load_owned(&state, &id, &auth).await?;

    let plan = db::get_plan(&state.db, &auth.user_id).await?;
    let since = state
        .config
        .plan_policy
        .retention_days(plan)
        .map(|days| now - Duration::days(days));

    let activations: Vec<ActivationView> = db::activations_for_link(&state.db, &link.id)
        .await?
        .into_iter()
        .map(|activation| ActivationView {
            is_expired: expiry::activation_expired(&activation, now),
            activation,
        })
        .collect();
    let recent_clicks = db::recent_click_events(&state.db, &link.id, since).await?;

    let considered = recent_clicks.len() as i64;
    let top_browsers = breakdown(recent_clicks.iter().map(|c| c.browser.as_deref()), considered);
    let top_devices = breakdown(
        recent_clicks.iter().map(|c| c.device_type.as_deref()),
        considered,
    );
    let top_referrers = breakdown(recent_clicks.iter().map(|c| c.referrer.as_deref()), considered);

    Ok(Json(AnalyticsResponse {
        link: LinkResponse::from_link(&link, &state.config.base_url, now),
        total_clicks: link.click_count,
        activations,
        recent_clicks,
        top_browsers,
        top_devices,
        top_referrers,
    }))
}

// ── Private helpers ────────────────────────────────────────────────────────

/// Fetch the link behind an id-scoped route. An unknown id is a 404; an id
/// that belongs to someone else gets the same generic 401 as a bad token.
async fn load_owned(state: &AppState, id: &str, auth: &AuthUser) -> Result<Link, AppError> {
    let link = db::get_link_by_id(&state.db, id)
        .await?
        .ok_or(AppError::NotFound("link"))?;
    if link.owner_id != auth.user_id {
        return Err(AppError::Unauthorized);
    }
    Ok(link)
}

/// Insert with generated slugs, retrying on the rare collision; the last
/// attempt uses a longer slug, which collides effectively never.
#[allow(clippy::too_many_arguments)]
async fn insert_with_generated_slug(
    state: &AppState,
    auth: &AuthUser,
    destination_url: &str,
    fallback_url: Option<&str>,
    mode: ExpirationMode,
    expires_at: Option<DateTime<Utc>>,
    click_limit: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Link, AppError> {
    for attempt in 0..5 {
        let slug = if attempt < 4 {
            state.config.slug_policy.generate()
        } else {
            let mut policy = state.config.slug_policy.clone();
            policy.generated_len += 2;
            policy.generate()
        };

        match db::create_link(
            &state.db,
            db::NewLink {
                slug: &slug,
                owner_id: &auth.user_id,
                destination_url,
                fallback_url,
                mode,
                expires_at,
                click_limit,
            },
            now,
        )
        .await
        {
            Ok(link) => return Ok(link),
            Err(e) if error::is_unique_violation(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(AppError::Conflict(
        "could not allocate a free slug; try again".into(),
    ))
}

/// Revive an expired link. Only a fresh rule is accepted here: the slug is
/// preserved by definition and everything else stays editable afterwards.
async fn reactivate(
    state: &AppState,
    link: &Link,
    req: &UpdateLinkRequest,
    now: DateTime<Utc>,
) -> Result<Link, AppError> {
    if !expiry::link_expired(link, now) {
        return Err(AppError::Conflict(
            "link is still live; reactivation applies to expired links".into(),
        ));
    }
    if req.slug.is_some()
        || req.destination_url.is_some()
        || req.fallback_url.is_some()
        || req.is_active.is_some()
    {
        return Err(AppError::Validation(
            "reactivation accepts only a fresh expiration rule (mode, expires_at, click_limit)"
                .into(),
        ));
    }

    let mode = req.mode.unwrap_or(link.mode);
    let (expires_at, click_limit) = match mode {
        ExpirationMode::ByDate => {
            let at = req.expires_at.ok_or_else(|| {
                AppError::Validation("a future expires_at is required to reactivate".into())
            })?;
            if at <= now {
                return Err(AppError::Validation("expires_at must be in the future".into()));
            }
            (Some(at), None)
        }
        ExpirationMode::ByClicks => {
            let limit = req.click_limit.ok_or_else(|| {
                AppError::Validation("a click_limit is required to reactivate".into())
            })?;
            if limit <= 0 {
                return Err(AppError::Validation(
                    "click_limit must be a positive integer".into(),
                ));
            }
            // The lifetime counter never resets, so a limit at or under it
            // would be born expired.
            if limit <= link.click_count {
                return Err(AppError::Validation(format!(
                    "click_limit must exceed the lifetime click count ({})",
                    link.click_count
                )));
            }
            (None, Some(limit))
        }
    };

    db::reactivate_link(&state.db, &link.id, mode, expires_at, click_limit, now)
        .await?
        .ok_or(AppError::NotFound("link"))
}

/// Check scheme and non-emptiness of a caller-supplied URL.
fn validate_url(url: &str, field: &str) -> Result<String, AppError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(AppError::Validation(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(url.to_owned())
}

/// Validate a creation-time rule: exactly the fields the mode needs, date in
/// the future, limit positive.
fn validate_rule(
    mode: ExpirationMode,
    expires_at: Option<DateTime<Utc>>,
    click_limit: Option<i64>,
    now: DateTime<Utc>,
) -> Result<(Option<DateTime<Utc>>, Option<i64>), AppError> {
    match mode {
        ExpirationMode::ByDate => {
            if click_limit.is_some() {
                return Err(AppError::Validation(
                    "click_limit is only valid for by_clicks links".into(),
                ));
            }
            let at = expires_at.ok_or_else(|| {
                AppError::Validation("expires_at is required for by_date links".into())
            })?;
            if at <= now {
                return Err(AppError::Validation("expires_at must be in the future".into()));
            }
            Ok((Some(at), None))
        }
        ExpirationMode::ByClicks => {
            if expires_at.is_some() {
                return Err(AppError::Validation(
                    "expires_at is only valid for by_date links".into(),
                ));
            }
            let limit = click_limit.ok_or_else(|| {
                AppError::Validation("click_limit is required for by_clicks links".into())
            })?;
            if limit <= 0 {
                return Err(AppError::Validation(
                    "click_limit must be a positive integer".into(),
                ));
            }
            Ok((None, Some(limit)))
        }
    }
}

/// Resolve the rule fields for a live-link edit: new values are validated,
/// absent ones carry over from the current rule when the mode allows it.
fn resolve_rule_edit(
    link: &Link,
    mode: ExpirationMode,
    req: &UpdateLinkRequest,
    now: DateTime<Utc>,
) -> Result<(Option<DateTime<Utc>>, Option<i64>), AppError> {
    match mode {
        ExpirationMode::ByDate => {
            if req.click_limit.is_some() {
                return Err(AppError::Validation(
                    "click_limit is only valid for by_clicks links".into(),
                ));
            }
            let at = match req.expires_at {
                Some(at) => {
                    if at <= now {
                        return Err(AppError::Validation(
                            "expires_at must be in the future".into(),
                        ));
                    }
                    Some(at)
                }
                None if link.mode == ExpirationMode::ByDate => link.expires_at,
                None => {
                    return Err(AppError::Validation(
                        "expires_at is required when switching to by_date".into(),
                    ));
                }
            };
            Ok((at, None))
        }
        ExpirationMode::ByClicks => {
            if req.expires_at.is_some() {
                return Err(AppError::Validation(
                    "expires_at is only valid for by_date links".into(),
                ));
            }
            let limit = match req.click_limit {
                Some(limit) => {
                    if limit <= 0 {
                        return Err(AppError::Validation(
                            "click_limit must be a positive integer".into(),
                        ));
                    }
                    Some(limit)
                }
                None if link.mode == ExpirationMode::ByClicks => link.click_limit,
                None => {
                    return Err(AppError::Validation(
                        "click_limit is required when switching to by_clicks".into(),
                    ));
                }
            };
            Ok((None, limit))
        }
    }
}

/// Tally occurrences of each non-empty value, sort descending by count, and
/// return the top 10 with their share of the considered set.
fn breakdown<'a>(values: impl Iterator<Item = Option<&'a str>>, total: i64) -> Vec<BreakdownRow> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for value in values.flatten() {
        if !value.is_empty() {
            *counts.entry(value.to_owned()).or_insert(0) += 1;
        }
    }

    let mut rows: Vec<(String, i64)> = counts.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows.truncate(10);

    rows.into_iter()
        .map(|(name, count)| BreakdownRow {
            name,
            count,
            pct: if total > 0 { count * 100 / total } else { 0 },
        })
        .collect()
}
