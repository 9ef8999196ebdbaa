//! Pure expiration rules.
//!
//! Everything here is a function of its arguments and the supplied clock.
//! Handlers and queries pass an explicit `now` so the same rules are
//! checkable in tests without waiting on real time. The SQL gate in
//! `db::record_click` encodes the same predicates; this module is the
//! readable statement of them.

use chrono::{DateTime, Utc};

use crate::models::{Activation, ExpirationMode, Link};

/// Whether a link should no longer redirect at `now`.
///
/// A deactivated link counts as expired regardless of its rule. A link
/// whose rule field is unset (no `expires_at` for by-date, no `click_limit`
/// for by-clicks) never expires on its own.
pub fn link_expired(link: &Link, now: DateTime<Utc>) -> bool {
    if !link.is_active {
        return true;
    }
    match link.mode {
        ExpirationMode::ByDate => link.expires_at.map_or(false, |at| at <= now),
        ExpirationMode::ByClicks => link
            .click_limit
            .map_or(false, |limit| link.click_count >= limit),
    }
}

/// Whether an activation window has ended at `now`. An activation that was
/// explicitly closed (deactivated_at set) is over no matter what its rule
/// says.
pub fn activation_expired(activation: &Activation, now: DateTime<Utc>) -> bool {
    if activation.deactivated_at.is_some() {
        return true;
    }
    match activation.mode {
        ExpirationMode::ByDate => activation.expires_at.map_or(false, |at| at <= now),
        ExpirationMode::ByClicks => activation
            .click_limit
            .map_or(false, |limit| activation.click_count >= limit),
    }
}

/// Clicks left before a by-clicks link expires, `None` when the link has no
/// click limit. Clamped at zero so an already-expired link never reports a
/// negative balance.
pub fn remaining_clicks(link: &Link) -> Option<i64> {
    match link.mode {
        ExpirationMode::ByClicks => link.click_limit.map(|limit| (limit - link.click_count).max(0)),
        ExpirationMode::ByDate => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base_link() -> Link {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Link {
            id: "l1".into(),
            slug: "spring".into(),
            owner_id: "u1".into(),
            destination_url: "https://example.com/sale".into(),
            fallback_url: None,
            mode: ExpirationMode::ByDate,
            expires_at: None,
            click_limit: None,
            click_count: 0,
            last_clicked_at: None,
            is_active: true,
            current_activation_id: Some("a1".into()),
            created_at: t,
            updated_at: t,
        }
    }

    #[test]
    fn by_date_link_expires_at_the_boundary() {
        let deadline = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let link = Link {
            expires_at: Some(deadline),
            ..base_link()
        };
        assert!(!link_expired(&link, deadline - Duration::seconds(1)));
        assert!(link_expired(&link, deadline));
        assert!(link_expired(&link, deadline + Duration::seconds(1)));
    }

    #[test]
    fn by_date_without_deadline_never_expires() {
        let link = base_link();
        let far = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap();
        assert!(!link_expired(&link, far));
    }

    #[test]
    fn by_clicks_link_expires_when_count_reaches_limit() {
        let mut link = Link {
            mode: ExpirationMode::ByClicks,
            click_limit: Some(3),
            ..base_link()
        };
        let now = link.created_at;
        link.click_count = 2;
        assert!(!link_expired(&link, now));
        link.click_count = 3;
        assert!(link_expired(&link, now));
        link.click_count = 4;
        assert!(link_expired(&link, now));
    }

    #[test]
    fn inactive_link_is_expired_even_with_headroom() {
        let link = Link {
            is_active: false,
            ..base_link()
        };
        assert!(link_expired(&link, link.created_at));
    }

    #[test]
    fn expiration_is_monotonic_in_time() {
        let deadline = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let link = Link {
            expires_at: Some(deadline),
            ..base_link()
        };
        let mut t = deadline - Duration::hours(2);
        let mut seen_expired = false;
        for _ in 0..8 {
            let expired = link_expired(&link, t);
            assert!(!seen_expired || expired, "link un-expired as time advanced");
            seen_expired = expired;
            t = t + Duration::hours(1);
        }
        assert!(seen_expired);
    }

    #[test]
    fn closed_activation_is_over_regardless_of_rule() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let activation = Activation {
            id: "a1".into(),
            link_id: "l1".into(),
            mode: ExpirationMode::ByClicks,
            expires_at: None,
            click_limit: Some(100),
            click_count: 1,
            activated_at: t,
            deactivated_at: Some(t),
            ended_reason: Some(crate::models::EndedReason::Manual),
        };
        assert!(activation_expired(&activation, t));
    }

    #[test]
    fn open_activation_follows_its_own_rule() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut activation = Activation {
            id: "a1".into(),
            link_id: "l1".into(),
            mode: ExpirationMode::ByClicks,
            expires_at: None,
            click_limit: Some(2),
            click_count: 1,
            activated_at: t,
            deactivated_at: None,
            ended_reason: None,
        };
        assert!(!activation_expired(&activation, t));
        activation.click_count = 2;
        assert!(activation_expired(&activation, t));
    }

    #[test]
    fn remaining_clicks_clamps_at_zero() {
        let link = Link {
            mode: ExpirationMode::ByClicks,
            click_limit: Some(5),
            click_count: 7,
            ..base_link()
        };
        assert_eq!(remaining_clicks(&link), Some(0));
        let link = Link {
            mode: ExpirationMode::ByClicks,
            click_limit: Some(5),
            click_count: 2,
            ..base_link()
        };
        assert_eq!(remaining_clicks(&link), Some(3));
        assert_eq!(remaining_clicks(&base_link()), None);
    }
}
