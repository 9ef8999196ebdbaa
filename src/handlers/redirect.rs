use crate::{
    db, expiry,
    error::AppError,
    models::Link,
    rate_limit::{self, Scope},
    AppState,
};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
};
use chrono::Utc;
use std::{net::SocketAddr, sync::Arc};
use woothee::parser::Parser;

/// Terminal page for dead or unknown slugs. Served with 410 for a link that
/// ran out, 404 for a slug that never existed, so visitors always land on a
/// coherent page instead of a bare API error.
const EXPIRED_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Link expired</title>
<style>
  body { font-family: system-ui, sans-serif; background: #fafafa; color: #333;
         display: flex; align-items: center; justify-content: center;
         height: 100vh; margin: 0; }
  main { text-align: center; max-width: 26rem; padding: 0 1rem; }
  h1 { font-size: 1.6rem; }
  p { color: #777; }
</style>
</head>
<body>
<main>
<h1>This link has expired</h1>
<p>The short link you followed is no longer active. If you believe this is a
mistake, ask whoever shared it with you for a fresh one.</p>
</main>
</body>
</html>
"#;

/// GET /r/:slug
///
/// The resolution pipeline, in order, each step a possible early exit:
/// 1. Per-IP-per-slug throttle, then the aggregate per-slug throttle. Both
///    reject with 429 + Retry-After before any link row is touched.
/// 2. Lookup by slug. Unknown slugs render the expired page with a 404.
/// 3. Expiration check. Expired links 302 to their fallback URL when one is
///    set (without counting a click), else serve the expired page with 410.
/// 4. Atomic click recording. A refused increment means the link expired
///    during this request, which lands on the same path as step 3.
/// 5. 302 to the destination.
///
/// No retries anywhere here: a storage failure is a 500 and the throttles in
/// step 1 are the backpressure mechanism.
pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let now = Utc::now();
    let limits = &state.config.rate_limits;

    // ── 1. Throttles ───────────────────────────────────────────────────────
    let ip = extract_ip(&headers, addr);

    let per_ip = match rate_limit::allow_and_increment(
        &state.db,
        Scope::RedirectIp,
        &format!("{ip}:{slug}"),
        limits.redirect_ip_limit,
        limits.redirect_ip_window,
        now,
    )
    .await
    {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!("Rate limiter error for ip '{}' on '{}': {:?}", ip, slug, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };
    if !per_ip.allowed {
        return AppError::RateLimited {
            retry_after: per_ip.retry_after_secs(now),
        }
        .into_response();
    }

    let per_slug = match rate_limit::allow_and_increment(
        &state.db,
        Scope::RedirectSlug,
        &slug,
        limits.redirect_slug_limit,
        limits.redirect_slug_window,
        now,
    )
    .await
    {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!("Rate limiter error for slug '{}': {:?}", slug, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };
    if !per_slug.allowed {
        return AppError::RateLimited {
            retry_after: per_slug.retry_after_secs(now),
        }
        .into_response();
    }

    // ── 2. Lookup ──────────────────────────────────────────────────────────
    let link = match db::get_link_by_slug(&state.db, &slug).await {
        Ok(Some(link)) => link,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, Html(EXPIRED_PAGE)).into_response();
        }
        Err(e) => {
            tracing::error!("DB error looking up slug '{}': {:?}", slug, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };

    // ── 3. Expiry gate ─────────────────────────────────────────────────────
    // Expired and fallback traffic must never touch the click counter, or a
    // by-clicks link would be pushed past its limit by dead hits.
    if expiry::link_expired(&link, now) {
        return expired_response(&link);
    }

    // ── 4. Record the hit ──────────────────────────────────────────────────
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let referrer = headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let (browser, os, device_type) = parse_user_agent(user_agent.as_deref());

    let click = db::ClickContext {
        referrer: referrer.as_deref(),
        user_agent: user_agent.as_deref(),
        browser: browser.as_deref(),
        os: os.as_deref(),
        device_type: device_type.as_deref(),
    };

    match db::record_click(&state.db, &link.id, &click, now).await {
        // ── 5. Redirect ────────────────────────────────────────────────────
        Ok(true) => found(&link.destination_url),
        // The link used up its rule between our check and the increment.
        Ok(false) => expired_response(&link),
        Err(e) => {
            tracing::error!("DB error recording click on '{}': {:?}", slug, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Where expired traffic goes: the fallback URL when the owner set one,
/// otherwise the terminal expired page.
fn expired_response(link: &Link) -> Response {
    match link.fallback_url.as_deref() {
        Some(fallback) => found(fallback),
        None => (StatusCode::GONE, Html(EXPIRED_PAGE)).into_response(),
    }
}

/// A plain 302. axum's `Redirect` helpers emit 303/307/308, so the status
/// and `Location` header are set by hand here.
fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => {
            tracing::error!("Stored URL is not a valid Location header: {}", location);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
        }
    }
}

/// Determine the real client IP, preferring common proxy headers over the
/// socket address.
fn extract_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    // X-Forwarded-For can be a comma-separated list; take the first entry.
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = xff.split(',').next().map(str::trim) {
            if !ip.is_empty() {
                return ip.to_owned();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_owned();
        }
    }

    addr.ip().to_string()
}

/// Parse a User-Agent string using woothee and return
/// `(browser_name, os_name, device_category)`.
fn parse_user_agent(ua: Option<&str>) -> (Option<String>, Option<String>, Option<String>) {
    let ua = match ua {
        Some(s) if !s.is_empty() => s,
        _ => return (None, None, None),
    };

    let known = |s: &str| {
        if s.is_empty() || s == "UNKNOWN" {
            None
        } else {
            Some(s.to_owned())
        }
    };

    match Parser::new().parse(ua) {
        Some(result) => (known(result.name), known(result.os), known(result.category)),
        None => (None, None, None),
    }
}
