mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::*;
use lapse::{db, models::PlanTier};
use serde_json::{json, Value};
use tower::ServiceExt;

fn link_payload(slug: &str) -> Value {
    json!({"destination_url": "https://x.example", "mode": "by_clicks",
           "click_limit": 100, "slug": slug})
}

fn webhook_event(secret: Option<&str>, body: Value) -> Request<Body> {
    let mut request = json_request("POST", "/billing/webhook", None, body);
    if let Some(secret) = secret {
        request
            .headers_mut()
            .insert("x-webhook-secret", secret.parse().unwrap());
    }
    request
}

async fn put_plan(app: &axum::Router, auth: &str, plan: &str) -> Value {
    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/account/plan",
            Some(auth),
            json!({"plan": plan}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn plan_change_reports_the_new_plan() {
    let (app, _pool) = test_app().await;

    let body = put_plan(&app, &bearer("fresh"), "plus").await;
    assert_eq!(body["plan"], "plus");
    assert_eq!(body["trimmed"], 0);
}

#[tokio::test]
async fn downgrade_trims_the_oldest_links_beyond_the_cap() {
    let (app, pool) = test_app().await;
    let auth = bearer("acct");
    put_plan(&app, &auth, "pro").await;

    // Five links, oldest first. The free cap in test_config is 2.
    for slug in ["l1", "l2", "l3", "l4", "l5"] {
        let response = app
            .clone()
            .oneshot(json_request("POST", "/links", Some(&auth), link_payload(slug)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let body = put_plan(&app, &auth, "free").await;
    assert_eq!(body["plan"], "free");
    assert_eq!(body["trimmed"], 3);

    let list = body_json(
        app.clone()
            .oneshot(authed("GET", "/links", &auth))
            .await
            .unwrap(),
    )
    .await;
    let mut active: Vec<&str> = Vec::new();
    let mut trimmed_id = None;
    for link in list.as_array().unwrap() {
        if link["is_active"].as_bool().unwrap() {
            active.push(link["slug"].as_str().unwrap());
        } else if link["slug"] == "l1" {
            trimmed_id = Some(link["id"].as_str().unwrap().to_owned());
        }
    }
    active.sort_unstable();
    assert_eq!(active, ["l4", "l5"], "the newest links survive");

    // The trimmed link's campaign is closed out with the downgrade reason.
    let history = db::activations_for_link(&pool, &trimmed_id.unwrap())
        .await
        .unwrap();
    assert_eq!(
        history[0].ended_reason,
        Some(lapse::models::EndedReason::PlanDowngrade)
    );

    // Running the same downgrade again finds nothing left to trim.
    let again = put_plan(&app, &auth, "free").await;
    assert_eq!(again["trimmed"], 0);
}

#[tokio::test]
async fn upgrades_never_touch_links() {
    let (app, _pool) = test_app().await;
    let auth = bearer("acct");
    for slug in ["k1", "k2"] {
        app.clone()
            .oneshot(json_request("POST", "/links", Some(&auth), link_payload(slug)))
            .await
            .unwrap();
    }

    let body = put_plan(&app, &auth, "pro").await;
    assert_eq!(body["trimmed"], 0);

    let list = body_json(
        app.clone()
            .oneshot(authed("GET", "/links", &auth))
            .await
            .unwrap(),
    )
    .await;
    assert!(list
        .as_array()
        .unwrap()
        .iter()
        .all(|l| l["is_active"].as_bool().unwrap()));
}

// ── Webhook intake ─────────────────────────────────────────────────────────

#[tokio::test]
async fn webhook_requires_the_shared_secret() {
    let (app, _pool) = test_app().await;
    let event = json!({"type": "subscription.active",
                       "data": {"user_id": "u1", "plan": "plus"}});

    let missing = app
        .clone()
        .oneshot(webhook_event(None, event.clone()))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .clone()
        .oneshot(webhook_event(Some("guess"), event))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(wrong).await["error"], "unauthorized");
}

#[tokio::test]
async fn webhook_moves_the_account_and_enforces_the_cap() {
    let (app, pool) = test_app().await;
    let auth = bearer("wh1");
    put_plan(&app, &auth, "pro").await;
    for slug in ["w1", "w2", "w3"] {
        app.clone()
            .oneshot(json_request("POST", "/links", Some(&auth), link_payload(slug)))
            .await
            .unwrap();
    }

    let response = app
        .clone()
        .oneshot(webhook_event(
            Some(WEBHOOK_SECRET),
            json!({"type": "subscription.cancelled", "data": {"user_id": "wh1"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "applied");

    assert_eq!(db::get_plan(&pool, "wh1").await.unwrap(), PlanTier::Free);

    // Free caps at 2, so the oldest of the three links went dark.
    let list = body_json(
        app.clone()
            .oneshot(authed("GET", "/links", &auth))
            .await
            .unwrap(),
    )
    .await;
    let dark: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .filter(|l| !l["is_active"].as_bool().unwrap())
        .map(|l| l["slug"].as_str().unwrap())
        .collect();
    assert_eq!(dark, ["w1"]);
}

#[tokio::test]
async fn webhook_acknowledges_unknown_event_kinds() {
    let (app, pool) = test_app().await;
    let auth = bearer("steady");
    put_plan(&app, &auth, "plus").await;

    let response = app
        .clone()
        .oneshot(webhook_event(
            Some(WEBHOOK_SECRET),
            json!({"type": "invoice.paid", "data": {"amount": 900}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ignored");
    assert_eq!(db::get_plan(&pool, "steady").await.unwrap(), PlanTier::Plus);
}

#[tokio::test]
async fn webhook_acknowledges_updates_without_a_plan() {
    let (app, _pool) = test_app().await;

    let response = app
        .clone()
        .oneshot(webhook_event(
            Some(WEBHOOK_SECRET),
            json!({"type": "subscription.updated", "data": {"user_id": "u1"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ignored");
}

#[tokio::test]
async fn webhook_reports_unmatched_subscribers() {
    let (app, _pool) = test_app().await;

    let response = app
        .clone()
        .oneshot(webhook_event(
            Some(WEBHOOK_SECRET),
            json!({"type": "subscription.active",
                   "data": {"email": "ghost@example.com", "plan": "plus"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "unmatched");
}

#[tokio::test]
async fn webhook_falls_back_to_email_linkage() {
    let (app, pool) = test_app().await;
    // Creating a link seeds the profile, including the token's email claim.
    let auth = bearer_with_email("mailed", Some("joe@example.com"));
    app.clone()
        .oneshot(json_request("POST", "/links", Some(&auth), link_payload("m1")))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(webhook_event(
            Some(WEBHOOK_SECRET),
            json!({"type": "subscription.updated",
                   "data": {"email": "joe@example.com", "plan": "pro"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "applied");
    assert_eq!(db::get_plan(&pool, "mailed").await.unwrap(), PlanTier::Pro);
}
