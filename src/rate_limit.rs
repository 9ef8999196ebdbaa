//! Fixed-window rate limiting backed by the `rate_limits` table.
//!
//! Counters live in the database rather than in process memory, so every
//! replica of the service sees the same counts and a restart forgets
//! nothing. Check-and-increment is a single upsert: concurrent requests
//! serialize on the row and the guarded `WHERE` keeps the count from ever
//! passing the limit.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

/// Counter namespace. Combined with the caller-supplied key it forms the
/// row identity, so an IP's redirect budget and its creation budget never
/// collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    RedirectIp,
    RedirectSlug,
    CreateLink,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::RedirectIp => "redirect_ip",
            Scope::RedirectSlug => "redirect_slug",
            Scope::CreateLink => "create_link",
        }
    }
}

/// Outcome of one check-and-increment.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: i64,
    /// Requests left in the window after this one. Zero when denied.
    pub remaining: i64,
    /// When the current window lapses and the count restarts.
    pub reset_at: DateTime<Utc>,
}

impl Decision {
    /// Seconds until `reset_at`, rounded up and never below one. Feeds the
    /// `Retry-After` response header.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> i64 {
        let ms = (self.reset_at - now).num_milliseconds();
        ((ms + 999) / 1000).max(1)
    }
}

/// Count this request against `scope:key` and report whether it fits.
///
/// One statement does the whole job. A fresh key inserts with count 1; an
/// existing row either rolls over into a new window (count back to 1) or
/// increments, and the `WHERE` clause refuses the update when the window is
/// still open and the count has already reached the limit. No row returned
/// means denied; the follow-up read only fetches the reset time for the
/// denial message.
pub async fn allow_and_increment(
    pool: &SqlitePool,
    scope: Scope,
    key: &str,
    limit: i64,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<Decision, sqlx::Error> {
    let now_ms = now.timestamp_millis();
    let fresh_expiry_ms = (now + window).timestamp_millis();

    let row = sqlx::query_as::<_, (i64, i64)>(
        r#"
        INSERT INTO rate_limits (scope, key, count, window_expires_at)
        VALUES (?1, ?2, 1, ?3)
        ON CONFLICT (scope, key) DO UPDATE SET
            count = CASE
                WHEN rate_limits.window_expires_at <= ?4 THEN 1
                ELSE rate_limits.count + 1
            END,
            window_expires_at = CASE
                WHEN rate_limits.window_expires_at <= ?4 THEN ?3
                ELSE rate_limits.window_expires_at
            END
        WHERE rate_limits.window_expires_at <= ?4 OR rate_limits.count < ?5
        RETURNING count, window_expires_at
        "#,
    )
    .bind(scope.as_str())
    .bind(key)
    .bind(fresh_expiry_ms)
    .bind(now_ms)
    .bind(limit)
    .fetch_optional(pool)
    .await?;

    if let Some((count, expires_ms)) = row {
        return Ok(Decision {
            allowed: true,
            limit,
            remaining: (limit - count).max(0),
            reset_at: from_millis(expires_ms, now + window),
        });
    }

    let existing = sqlx::query_scalar::<_, i64>(
        "SELECT window_expires_at FROM rate_limits WHERE scope = ?1 AND key = ?2",
    )
    .bind(scope.as_str())
    .bind(key)
    .fetch_optional(pool)
    .await?;

    Ok(Decision {
        allowed: false,
        limit,
        remaining: 0,
        reset_at: existing.map_or(now + window, |ms| from_millis(ms, now + window)),
    })
}

fn from_millis(ms: i64, fallback: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE rate_limits (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                count INTEGER NOT NULL,
                window_expires_at INTEGER NOT NULL,
                PRIMARY KEY (scope, key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn counts_up_to_the_limit_then_denies() {
        let pool = pool().await;
        let window = Duration::minutes(1);
        for expected_remaining in [2, 1, 0] {
            let d = allow_and_increment(&pool, Scope::RedirectIp, "1.2.3.4", 3, window, t0())
                .await
                .unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }
        let d = allow_and_increment(&pool, Scope::RedirectIp, "1.2.3.4", 3, window, t0())
            .await
            .unwrap();
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.reset_at, t0() + window);
    }

    #[tokio::test]
    async fn limit_of_one_denies_the_second_request() {
        let pool = pool().await;
        let window = Duration::minutes(1);
        let first = allow_and_increment(&pool, Scope::CreateLink, "u1", 1, window, t0())
            .await
            .unwrap();
        assert!(first.allowed);
        let second = allow_and_increment(&pool, Scope::CreateLink, "u1", 1, window, t0())
            .await
            .unwrap();
        assert!(!second.allowed);
    }

    #[tokio::test]
    async fn window_rollover_restarts_the_count() {
        let pool = pool().await;
        let window = Duration::minutes(1);
        for _ in 0..2 {
            allow_and_increment(&pool, Scope::RedirectIp, "9.9.9.9", 2, window, t0())
                .await
                .unwrap();
        }
        let denied = allow_and_increment(&pool, Scope::RedirectIp, "9.9.9.9", 2, window, t0())
            .await
            .unwrap();
        assert!(!denied.allowed);

        let later = t0() + window;
        let d = allow_and_increment(&pool, Scope::RedirectIp, "9.9.9.9", 2, window, later)
            .await
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
        assert_eq!(d.reset_at, later + window);
    }

    #[tokio::test]
    async fn scopes_do_not_share_counters() {
        let pool = pool().await;
        let window = Duration::minutes(1);
        let d = allow_and_increment(&pool, Scope::RedirectIp, "k", 1, window, t0())
            .await
            .unwrap();
        assert!(d.allowed);
        let d = allow_and_increment(&pool, Scope::RedirectSlug, "k", 1, window, t0())
            .await
            .unwrap();
        assert!(d.allowed, "different scope must have its own counter");
        let d = allow_and_increment(&pool, Scope::RedirectIp, "other", 1, window, t0())
            .await
            .unwrap();
        assert!(d.allowed, "different key must have its own counter");
    }

    #[tokio::test]
    async fn retry_after_rounds_up_and_floors_at_one() {
        let pool = pool().await;
        let window = Duration::seconds(90);
        allow_and_increment(&pool, Scope::RedirectIp, "k", 1, window, t0())
            .await
            .unwrap();
        let denied = allow_and_increment(&pool, Scope::RedirectIp, "k", 1, window, t0())
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs(t0()), 90);
        let almost_over = t0() + Duration::milliseconds(89_500);
        assert_eq!(denied.retry_after_secs(almost_over), 1);
        assert_eq!(denied.retry_after_secs(t0() + window), 1);
    }
}
