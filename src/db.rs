use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::is_unique_violation;
use crate::models::{Activation, ClickEvent, EndedReason, ExpirationMode, Link, PlanTier};

// ── Links ──────────────────────────────────────────────────────────────────

/// Fields for a brand-new link. The row id and the first activation are
/// minted inside [`create_link`].
pub struct NewLink<'a> {
    pub slug: &'a str,
    pub owner_id: &'a str,
    pub destination_url: &'a str,
    pub fallback_url: Option<&'a str>,
    pub mode: ExpirationMode,
    pub expires_at: Option<DateTime<Utc>>,
    pub click_limit: Option<i64>,
}

/// Insert a new link together with its first activation, in one transaction,
/// and return the created row. A slug collision surfaces as the UNIQUE
/// violation from the insert; callers translate it to a conflict.
pub async fn create_link(
    pool: &SqlitePool,
    new: NewLink<'_>,
    now: DateTime<Utc>,
) -> Result<Link, sqlx::Error> {
    let link_id = Uuid::new_v4().to_string();
    let activation_id = Uuid::new_v4().to_string();

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO links
             (id, slug, owner_id, destination_url, fallback_url, mode,
              expires_at, click_limit, click_count, last_clicked_at,
              is_active, current_activation_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, 1, ?9, ?10, ?10)",
    )
    .bind(&link_id)
    .bind(new.slug)
    .bind(new.owner_id)
    .bind(new.destination_url)
    .bind(new.fallback_url)
    .bind(new.mode)
    .bind(new.expires_at)
    .bind(new.click_limit)
    .bind(&activation_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO activations
             (id, link_id, activated_at, deactivated_at, mode, expires_at,
              click_limit, click_count, ended_reason)
         VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, 0, NULL)",
    )
    .bind(&activation_id)
    .bind(&link_id)
    .bind(now)
    .bind(new.mode)
    .bind(new.expires_at)
    .bind(new.click_limit)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let link: Link = sqlx::query_as(
        "SELECT id, slug, owner_id, destination_url, fallback_url, mode,
                expires_at, click_limit, click_count, last_clicked_at,
                is_active, current_activation_id, created_at, updated_at
         FROM links WHERE id = ?1",
    )
    .bind(&link_id)
    .fetch_one(pool)
    .await?;

    Ok(link)
}

/// Fetch a link by its public slug, regardless of status. The redirect path
/// decides what to do with inactive or expired rows.
pub async fn get_link_by_slug(
    pool: &SqlitePool,
    slug: &str,
) -> Result<Option<Link>, sqlx::Error> {
    let link: Option<Link> = sqlx::query_as(
        "SELECT id, slug, owner_id, destination_url, fallback_url, mode,
                expires_at, click_limit, click_count, last_clicked_at,
                is_active, current_activation_id, created_at, updated_at
         FROM links WHERE slug = ?1",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;

    Ok(link)
}

/// Fetch a link by its primary key, any status.
pub async fn get_link_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Link>, sqlx::Error> {
    let link: Option<Link> = sqlx::query_as(
        "SELECT id, slug, owner_id, destination_url, fallback_url, mode,
                expires_at, click_limit, click_count, last_clicked_at,
                is_active, current_activation_id, created_at, updated_at
         FROM links WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(link)
}

/// All of one owner's links, newest first.
pub async fn list_links_for_owner(
    pool: &SqlitePool,
    owner_id: &str,
) -> Result<Vec<Link>, sqlx::Error> {
    let links: Vec<Link> = sqlx::query_as(
        "SELECT id, slug, owner_id, destination_url, fallback_url, mode,
                expires_at, click_limit, click_count, last_clicked_at,
                is_active, current_activation_id, created_at, updated_at
         FROM links WHERE owner_id = ?1
         ORDER BY created_at DESC",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    Ok(links)
}

/// How many of the owner's links are currently active. Read by the creation
/// cap check and by plan enforcement.
pub async fn count_active_links(pool: &SqlitePool, owner_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM links WHERE owner_id = ?1 AND is_active = 1")
        .bind(owner_id)
        .fetch_one(pool)
        .await
}

/// New values for a link's mutable fields. Callers resolve partial updates
/// against the current row before getting here, so every field is the full
/// intended value.
pub struct LinkChanges<'a> {
    pub slug: &'a str,
    pub destination_url: &'a str,
    pub fallback_url: Option<&'a str>,
    pub mode: ExpirationMode,
    pub expires_at: Option<DateTime<Utc>>,
    pub click_limit: Option<i64>,
}

/// Write a live link's new settings and mirror the rule onto its open
/// activation, so campaign history reflects the rule the campaign actually
/// ran under. Returns the fresh row, or `None` if the link vanished.
pub async fn update_link(
    pool: &SqlitePool,
    id: &str,
    changes: LinkChanges<'_>,
    now: DateTime<Utc>,
) -> Result<Option<Link>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE links
         SET slug = ?1, destination_url = ?2, fallback_url = ?3, mode = ?4,
             expires_at = ?5, click_limit = ?6, updated_at = ?7
         WHERE id = ?8",
    )
    .bind(changes.slug)
    .bind(changes.destination_url)
    .bind(changes.fallback_url)
    .bind(changes.mode)
    .bind(changes.expires_at)
    .bind(changes.click_limit)
    .bind(now)
    .bind(id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(None);
    }

    sqlx::query(
        "UPDATE activations SET mode = ?1, expires_at = ?2, click_limit = ?3
         WHERE link_id = ?4 AND deactivated_at IS NULL",
    )
    .bind(changes.mode)
    .bind(changes.expires_at)
    .bind(changes.click_limit)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    get_link_by_id(pool, id).await
}

/// Revive an expired link under a fresh rule: close whatever activation is
/// still open, open a new one, and flip the link back on. The slug and the
/// lifetime counters are untouched.
pub async fn reactivate_link(
    pool: &SqlitePool,
    id: &str,
    mode: ExpirationMode,
    expires_at: Option<DateTime<Utc>>,
    click_limit: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Option<Link>, sqlx::Error> {
    let activation_id = Uuid::new_v4().to_string();

    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE activations SET deactivated_at = ?1, ended_reason = ?2
         WHERE link_id = ?3 AND deactivated_at IS NULL",
    )
    .bind(now)
    .bind(EndedReason::Natural)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO activations
             (id, link_id, activated_at, deactivated_at, mode, expires_at,
              click_limit, click_count, ended_reason)
         VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, 0, NULL)",
    )
    .bind(&activation_id)
    .bind(id)
    .bind(now)
    .bind(mode)
    .bind(expires_at)
    .bind(click_limit)
    .execute(&mut *tx)
    .await?;

    let updated = sqlx::query(
        "UPDATE links
         SET mode = ?1, expires_at = ?2, click_limit = ?3, is_active = 1,
             current_activation_id = ?4, updated_at = ?5
         WHERE id = ?6",
    )
    .bind(mode)
    .bind(expires_at)
    .bind(click_limit)
    .bind(&activation_id)
    .bind(now)
    .bind(id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(None);
    }

    tx.commit().await?;

    get_link_by_id(pool, id).await
}

/// Switch a set of links off and close their open activations with the given
/// reason, in one transaction. Returns how many links actually flipped from
/// active to inactive, so re-running over already-dead links reports zero.
pub async fn deactivate_links(
    pool: &SqlitePool,
    ids: &[String],
    reason: EndedReason,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;

    let mut close: QueryBuilder<Sqlite> =
        QueryBuilder::new("UPDATE activations SET deactivated_at = ");
    close.push_bind(now);
    close.push(", ended_reason = ");
    close.push_bind(reason);
    close.push(" WHERE deactivated_at IS NULL AND link_id IN (");
    let mut ids_in = close.separated(", ");
    for id in ids {
        ids_in.push_bind(id);
    }
    close.push(")");
    close.build().execute(&mut *tx).await?;

    let mut off: QueryBuilder<Sqlite> = QueryBuilder::new(
        "UPDATE links SET is_active = 0, current_activation_id = NULL, updated_at = ",
    );
    off.push_bind(now);
    off.push(" WHERE is_active = 1 AND id IN (");
    let mut ids_in = off.separated(", ");
    for id in ids {
        ids_in.push_bind(id);
    }
    off.push(")");
    let affected = off.build().execute(&mut *tx).await?.rows_affected();

    tx.commit().await?;

    Ok(affected)
}

/// Hard-delete a link, closing its open activations first so history never
/// holds an activation that looks alive for a row that no longer exists.
/// Activations and click events themselves are kept. Callers check
/// ownership before getting here.
pub async fn delete_link(
    pool: &SqlitePool,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let deleted: Option<String> =
        sqlx::query_scalar("DELETE FROM links WHERE id = ?1 RETURNING id")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

    if deleted.is_none() {
        return Ok(false);
    }

    sqlx::query(
        "UPDATE activations SET deactivated_at = ?1, ended_reason = ?2
         WHERE link_id = ?3 AND deactivated_at IS NULL",
    )
    .bind(now)
    .bind(EndedReason::Deleted)
    .bind(id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(true)
}

// ── Clicks ─────────────────────────────────────────────────────────────────

/// Request-side details recorded with a successful resolution.
pub struct ClickContext<'a> {
    pub referrer: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub browser: Option<&'a str>,
    pub os: Option<&'a str>,
    pub device_type: Option<&'a str>,
}

/// Count one hit against a link, atomically.
///
/// The guarded UPDATE is the whole race story: it only lands while the link
/// is active and its rule still has headroom, re-checked inside the
/// statement, so two clicks straddling the limit can never both pass. A
/// counted hit also writes the audit event and bumps the open activation in
/// the same transaction, and the hit that uses up the last click closes the
/// activation with `ended_reason = natural` and switches the link off.
///
/// Returns `false` when the gate refused, meaning the link expired sometime
/// between the caller's check and now; the caller takes the fallback path.
pub async fn record_click(
    pool: &SqlitePool,
    link_id: &str,
    click: &ClickContext<'_>,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let hit: Option<(i64, Option<i64>, ExpirationMode, Option<String>)> = sqlx::query_as(
        "UPDATE links
         SET click_count = click_count + 1, last_clicked_at = ?1, updated_at = ?1
         WHERE id = ?2
           AND is_active = 1
           AND (mode <> 'by_date' OR expires_at IS NULL OR expires_at > ?1)
           AND (mode <> 'by_clicks' OR click_limit IS NULL
                OR click_count < click_limit)
         RETURNING click_count, click_limit, mode, current_activation_id",
    )
    .bind(now)
    .bind(link_id)
    .fetch_optional(&mut *tx)
    .await?;

    let (click_count, click_limit, mode, activation_id) = match hit {
        Some(row) => row,
        None => return Ok(false),
    };

    sqlx::query(
        "INSERT INTO click_events
             (id, link_id, clicked_at, referrer, user_agent, browser, os, device_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(link_id)
    .bind(now)
    .bind(click.referrer)
    .bind(click.user_agent)
    .bind(click.browser)
    .bind(click.os)
    .bind(click.device_type)
    .execute(&mut *tx)
    .await?;

    if let Some(activation_id) = &activation_id {
        sqlx::query("UPDATE activations SET click_count = click_count + 1 WHERE id = ?1")
            .bind(activation_id)
            .execute(&mut *tx)
            .await?;
    }

    let used_up = mode == ExpirationMode::ByClicks
        && click_limit.map_or(false, |limit| click_count >= limit);
    if used_up {
        sqlx::query(
            "UPDATE links SET is_active = 0, current_activation_id = NULL, updated_at = ?1
             WHERE id = ?2",
        )
        .bind(now)
        .bind(link_id)
        .execute(&mut *tx)
        .await?;

        if let Some(activation_id) = &activation_id {
            sqlx::query(
                "UPDATE activations SET deactivated_at = ?1, ended_reason = ?2
                 WHERE id = ?3 AND deactivated_at IS NULL",
            )
            .bind(now)
            .bind(EndedReason::Natural)
            .bind(activation_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;

    Ok(true)
}

/// A link's activation history in campaign order, oldest first.
pub async fn activations_for_link(
    pool: &SqlitePool,
    link_id: &str,
) -> Result<Vec<Activation>, sqlx::Error> {
    let activations: Vec<Activation> = sqlx::query_as(
        "SELECT id, link_id, activated_at, deactivated_at, mode, expires_at,
                click_limit, click_count, ended_reason
         FROM activations WHERE link_id = ?1
         ORDER BY activated_at ASC, id ASC",
    )
    .bind(link_id)
    .fetch_all(pool)
    .await?;

    Ok(activations)
}

/// The most recent click events for a link, newest first, capped at 500 and
/// optionally bounded below by the caller's retention horizon.
pub async fn recent_click_events(
    pool: &SqlitePool,
    link_id: &str,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<ClickEvent>, sqlx::Error> {
    let events: Vec<ClickEvent> = match since {
        Some(since) => {
            sqlx::query_as(
                "SELECT id, link_id, clicked_at, referrer, user_agent, browser,
                        os, device_type
                 FROM click_events
                 WHERE link_id = ?1 AND clicked_at >= ?2
                 ORDER BY clicked_at DESC
                 LIMIT 500",
            )
            .bind(link_id)
            .bind(since)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT id, link_id, clicked_at, referrer, user_agent, browser,
                        os, device_type
                 FROM click_events
                 WHERE link_id = ?1
                 ORDER BY clicked_at DESC
                 LIMIT 500",
            )
            .bind(link_id)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(events)
}

// ── Enforcement ────────────────────────────────────────────────────────────

/// One batch of the owner's oldest active links, creation order with
/// last-update as the tie-break. Plan enforcement walks these until the
/// excess is gone.
pub async fn oldest_active_link_ids(
    pool: &SqlitePool,
    owner_id: &str,
    limit: i64,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT id FROM links WHERE owner_id = ?1 AND is_active = 1
         ORDER BY created_at ASC, updated_at ASC
         LIMIT ?2",
    )
    .bind(owner_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

// ── Profiles ───────────────────────────────────────────────────────────────

/// Make sure a profile row exists for this user and return its plan. A fresh
/// row starts on the free tier; an existing row keeps its stored email and
/// only adopts the token's email when it had none. A token email that
/// already belongs to a different profile is dropped rather than stored
/// twice; `email` is UNIQUE and its first profile keeps it.
pub async fn ensure_profile(
    pool: &SqlitePool,
    user_id: &str,
    email: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PlanTier, sqlx::Error> {
    match upsert_profile(pool, user_id, email, now).await {
        // The conflict target is user_id, so a unique violation here can
        // only be the email column colliding with another profile.
        Err(e) if email.is_some() && is_unique_violation(&e) => {
            upsert_profile(pool, user_id, None, now).await
        }
        other => other,
    }
}

async fn upsert_profile(
    pool: &SqlitePool,
    user_id: &str,
    email: Option<&str>,
    now: DateTime<Utc>,
) -> Result<PlanTier, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO profiles (user_id, email, plan, created_at, updated_at)
         VALUES (?1, ?2, 'free', ?3, ?3)
         ON CONFLICT (user_id) DO UPDATE SET
             email = COALESCE(profiles.email, excluded.email)
         RETURNING plan",
    )
    .bind(user_id)
    .bind(email)
    .bind(now)
    .fetch_one(pool)
    .await
}

/// The user's current plan; users without a profile row are on the free tier.
pub async fn get_plan(pool: &SqlitePool, user_id: &str) -> Result<PlanTier, sqlx::Error> {
    let plan: Option<PlanTier> =
        sqlx::query_scalar("SELECT plan FROM profiles WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;

    Ok(plan.unwrap_or(PlanTier::Free))
}

/// Persist a plan change, creating the profile if the billing event arrives
/// before the user's first authenticated request.
pub async fn set_plan(
    pool: &SqlitePool,
    user_id: &str,
    plan: PlanTier,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO profiles (user_id, email, plan, created_at, updated_at)
         VALUES (?1, NULL, ?2, ?3, ?3)
         ON CONFLICT (user_id) DO UPDATE SET
             plan = excluded.plan, updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(plan)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Resolve a user id from a profile email. Unique index on `email` makes the
/// answer unambiguous.
pub async fn find_user_by_email(
    pool: &SqlitePool,
    email: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT user_id FROM profiles WHERE email = ?1")
        .bind(email)
        .fetch_optional(pool)
        .await
}
