//! Router-level tests driving the full axum stack
//!
//! - Login, identity, refresh and logout (HTTP-A01 to HTTP-A06)
//! - Credit consumption (HTTP-U01 to HTTP-U04)
//! - Checkout and webhooks (HTTP-C01 to HTTP-C08)

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE},
        HeaderMap, Method, Request, StatusCode,
    },
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::Barrier;
use tower::ServiceExt;
use wizpix_billing::sign_payload;
use wizpix_shared::models::CheckoutStatus;
use wizpix_shared::Store;

use super::create_router;
use crate::auth::hash_password;
use crate::test_support::{harness, Harness, PASSWORD, WEBHOOK_SECRET};

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl Reply {
    /// Value of the refresh cookie set by this response
    fn refresh_cookie(&self) -> Option<String> {
        self.headers
            .get(SET_COOKIE)
            .and_then(|h| h.to_str().ok())
            .and_then(|c| c.split(';').next())
            .and_then(|pair| pair.strip_prefix("tokenRefresh="))
            .map(String::from)
    }
}

async fn send(h: &Harness, request: Request<Body>) -> Reply {
    let response = create_router(h.state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    Reply {
        status,
        headers,
        body,
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn with_bearer(mut request: Request<Body>, token: &str) -> Request<Body> {
    request
        .headers_mut()
        .insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
    request
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn refresh_request(cookie: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/api/auth/refresh")
        .header(COOKIE, format!("theme=dark; tokenRefresh={cookie}"))
        .body(Body::empty())
        .unwrap()
}

fn signed_webhook(payload: &Value, secret: &str) -> Request<Body> {
    let payload = payload.to_string();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let signature = sign_payload(secret, now, &payload).unwrap();
    Request::builder()
        .method(Method::POST)
        .uri("/api/stripe/webhook")
        .header(CONTENT_TYPE, "application/json")
        .header("stripe-signature", format!("t={now},v1={signature}"))
        .body(Body::from(payload))
        .unwrap()
}

fn completed_event(event_id: &str, session_id: &str, email: &str) -> Value {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "data": { "object": {
            "id": session_id,
            "customer_details": { "email": email, "name": "Ada Lovelace" },
            "customer": "cus_router",
            "subscription": "sub_router",
            "metadata": { "email": email, "plan_code": "hobby", "currency": "EUR" }
        }}
    })
}

async fn login(h: &Harness, email: &str) -> Reply {
    send(
        h,
        post_json("/api/auth/login", json!({ "email": email, "password": PASSWORD })),
    )
    .await
}

mod auth_routes {
    use super::*;

    // =========================================================================
    // HTTP-A01: Login returns an access token and a refresh cookie
    // =========================================================================
    #[tokio::test]
    async fn test_login_sets_refresh_cookie() {
        let h = harness().await;
        h.subscriber("ada@example.com", "free").await;

        let reply = login(&h, "  ADA@example.com ").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["status"], "success");
        assert!(reply.body["token"].as_str().unwrap().split('.').count() == 3);
        assert!(reply.refresh_cookie().is_some());

        let set_cookie = reply.headers.get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Path=/api/auth"));
        assert!(set_cookie.contains("Max-Age=3600"));
    }

    // =========================================================================
    // HTTP-A02: Unknown email and wrong password look the same
    // =========================================================================
    #[tokio::test]
    async fn test_login_failures_are_uniform() {
        let h = harness().await;
        h.subscriber("ada@example.com", "free").await;

        let wrong_password = send(
            &h,
            post_json(
                "/api/auth/login",
                json!({ "email": "ada@example.com", "password": "nope" }),
            ),
        )
        .await;
        let unknown = login(&h, "nobody@example.com").await;

        assert_eq!(wrong_password.status, StatusCode::UNAUTHORIZED);
        assert_eq!(unknown.status, StatusCode::UNAUTHORIZED);
        assert_eq!(wrong_password.body, unknown.body);
        assert!(wrong_password.refresh_cookie().is_none());

        let missing = send(&h, post_json("/api/auth/login", json!({ "email": "" }))).await;
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    }

    // =========================================================================
    // HTTP-A03: /me requires a bearer token and reports credits
    // =========================================================================
    #[tokio::test]
    async fn test_me_requires_auth() {
        let h = harness().await;
        h.subscriber("ada@example.com", "hobby").await;

        let anonymous = send(&h, get("/api/auth/me")).await;
        assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);

        let garbage = send(&h, with_bearer(get("/api/auth/me"), "a.b.c")).await;
        assert_eq!(garbage.status, StatusCode::UNAUTHORIZED);

        let token = login(&h, "ada@example.com").await.body["token"]
            .as_str()
            .unwrap()
            .to_string();
        let me = send(&h, with_bearer(get("/api/auth/me"), &token)).await;
        assert_eq!(me.status, StatusCode::OK);
        assert_eq!(me.body["user"]["email"], "ada@example.com");
        assert_eq!(me.body["credits"]["remaining_last_24h"], 50);
    }

    // =========================================================================
    // HTTP-A04: Refresh rotates the cookie; the old cookie stops working
    // =========================================================================
    #[tokio::test]
    async fn test_refresh_rotates_cookie() {
        let h = harness().await;
        h.subscriber("ada@example.com", "free").await;
        let first = login(&h, "ada@example.com").await.refresh_cookie().unwrap();

        let rotated = send(&h, refresh_request(&first)).await;
        assert_eq!(rotated.status, StatusCode::OK);
        assert!(rotated.body["token"].is_string());
        let second = rotated.refresh_cookie().unwrap();
        assert_ne!(first, second);

        let replay = send(&h, refresh_request(&first)).await;
        assert_eq!(replay.status, StatusCode::UNAUTHORIZED);

        // Reuse of the first cookie revoked its descendant as well
        let after_replay = send(&h, refresh_request(&second)).await;
        assert_eq!(after_replay.status, StatusCode::UNAUTHORIZED);
    }

    // =========================================================================
    // HTTP-A05: Refresh without a cookie is rejected
    // =========================================================================
    #[tokio::test]
    async fn test_refresh_without_cookie() {
        let h = harness().await;
        let reply = send(
            &h,
            Request::builder()
                .method(Method::POST)
                .uri("/api/auth/refresh")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert_eq!(reply.body["code"], 401);
    }

    // =========================================================================
    // HTTP-A06: Logout revokes refresh tokens and clears the cookie
    // =========================================================================
    #[tokio::test]
    async fn test_logout_revokes_and_clears() {
        let h = harness().await;
        h.subscriber("ada@example.com", "free").await;
        let session = login(&h, "ada@example.com").await;
        let token = session.body["token"].as_str().unwrap().to_string();
        let cookie = session.refresh_cookie().unwrap();

        let logout = send(
            &h,
            with_bearer(post_json("/api/auth/logout", json!({})), &token),
        )
        .await;
        assert_eq!(logout.status, StatusCode::OK);
        assert_eq!(logout.refresh_cookie().as_deref(), Some(""));
        let cleared = logout.headers.get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cleared.contains("Max-Age=0"));

        let refresh = send(&h, refresh_request(&cookie)).await;
        assert_eq!(refresh.status, StatusCode::UNAUTHORIZED);
    }
}

mod usage_routes {
    use super::*;

    async fn token_for(h: &Harness, email: &str) -> String {
        login(h, email).await.body["token"].as_str().unwrap().to_string()
    }

    fn consume(token: &str, body: Value) -> Request<Body> {
        with_bearer(post_json("/api/usage/consume", body), token)
    }

    // =========================================================================
    // HTTP-U01: quota=5, five downloads succeed, the sixth is rejected
    // =========================================================================
    #[tokio::test]
    async fn test_quota_exhaustion() {
        let h = harness().await;
        h.subscriber("ada@example.com", "free").await;
        let token = token_for(&h, "ada@example.com").await;

        for i in 1..=5 {
            let reply = send(&h, consume(&token, json!({ "reason": "download" }))).await;
            assert_eq!(reply.status, StatusCode::OK);
            assert_eq!(reply.body["credits"]["used_last_24h"], i);
            assert_eq!(reply.body["credits"]["remaining_last_24h"], 5 - i);
        }

        let sixth = send(&h, consume(&token, json!({ "reason": "download" }))).await;
        assert_eq!(sixth.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(sixth.body["error"], "no_credit_left");
        assert_eq!(sixth.body["credits"]["remaining_last_24h"], 0);

        let history = send(&h, with_bearer(get("/api/usage/history"), &token)).await;
        assert_eq!(history.body["usage"].as_array().unwrap().len(), 5);
    }

    // =========================================================================
    // HTTP-U02: No subscription is a structured 403
    // =========================================================================
    #[tokio::test]
    async fn test_no_active_subscription() {
        let h = harness().await;
        h.store
            .insert_user("solo@example.com", &hash_password(PASSWORD).unwrap())
            .await;
        let token = token_for(&h, "solo@example.com").await;

        let reply = send(&h, consume(&token, json!({ "reason": "download" }))).await;
        assert_eq!(reply.status, StatusCode::FORBIDDEN);
        assert_eq!(reply.body["error"], "no_active_subscription");

        let window = send(&h, with_bearer(get("/api/usage"), &token)).await;
        assert_eq!(window.status, StatusCode::OK);
        assert!(window.body["credits"].is_null());
    }

    // =========================================================================
    // HTTP-U03: Unknown reasons are rejected before touching the ledger
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_reason() {
        let h = harness().await;
        h.subscriber("ada@example.com", "free").await;
        let token = token_for(&h, "ada@example.com").await;

        let reply = send(&h, consume(&token, json!({ "reason": "print" }))).await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);

        let window = send(&h, with_bearer(get("/api/usage"), &token)).await;
        assert_eq!(window.body["credits"]["used_last_24h"], 0);
    }

    // =========================================================================
    // HTTP-U04: A retried request id is charged once
    // =========================================================================
    #[tokio::test]
    async fn test_request_id_is_idempotent() {
        let h = harness().await;
        h.subscriber("ada@example.com", "free").await;
        let token = token_for(&h, "ada@example.com").await;

        for _ in 0..3 {
            let reply = send(
                &h,
                consume(&token, json!({ "reason": "download", "requestId": "req-1" })),
            )
            .await;
            assert_eq!(reply.status, StatusCode::OK);
            assert_eq!(reply.body["credits"]["used_last_24h"], 1);
        }
    }
}

mod checkout_routes {
    use super::*;

    async fn start_checkout(h: &Harness, email: &str) -> String {
        let reply = send(
            h,
            post_json(
                "/api/stripe/checkout",
                json!({ "email": email, "plan": "hobby", "currency": "eur" }),
            ),
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK);
        reply.body["sessionId"].as_str().unwrap().to_string()
    }

    fn finalize(session_id: &str) -> Request<Body> {
        post_json("/api/stripe/finalize", json!({ "sessionId": session_id }))
    }

    // =========================================================================
    // HTTP-C01: Checkout creation registers a pending session
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_creation() {
        let h = harness().await;
        let reply = send(
            &h,
            post_json(
                "/api/stripe/checkout",
                json!({ "email": "New@Example.com", "plan": "hobby", "currency": "eur" }),
            ),
        )
        .await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["sessionId"], "cs_test_1");
        assert_eq!(
            reply.body["redirect"],
            "https://checkout.example.com/pay/cs_test_1"
        );

        let session = h.store.checkout_get("cs_test_1").await.unwrap().unwrap();
        assert_eq!(session.status, CheckoutStatus::Pending);
        assert_eq!(session.email, "new@example.com");
        assert_eq!(session.currency, "EUR");

        let requests = h.gateway.requests.lock().await;
        assert_eq!(requests[0].price_id, "price_hobby_EUR");
        assert!(requests[0]
            .success_url
            .starts_with("https://wizpix.test?checkout=success"));

        let free = send(
            &h,
            post_json(
                "/api/stripe/checkout",
                json!({ "email": "x@example.com", "plan": "free" }),
            ),
        )
        .await;
        assert_eq!(free.status, StatusCode::BAD_REQUEST);

        let unknown = send(
            &h,
            post_json(
                "/api/stripe/checkout",
                json!({ "email": "x@example.com", "plan": "platinum" }),
            ),
        )
        .await;
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    }

    // =========================================================================
    // HTTP-C02: Finalize never reveals whether a session exists
    // =========================================================================
    #[tokio::test]
    async fn test_finalize_pending_and_unknown() {
        let h = harness().await;
        let session_id = start_checkout(&h, "ada@example.com").await;

        let pending = send(&h, finalize(&session_id)).await;
        assert_eq!(pending.status, StatusCode::OK);
        assert_eq!(pending.body, json!({ "status": "pending" }));

        let unknown = send(&h, finalize("cs_does_not_exist")).await;
        assert_eq!(unknown.body, pending.body);

        let missing = send(&h, post_json("/api/stripe/finalize", json!({}))).await;
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    }

    // =========================================================================
    // HTTP-C03: Webhook completion then finalize signs the new user in
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_to_finalize_flow() {
        let h = harness().await;
        h.store
            .save_verified_signup("ada@example.com", &hash_password(PASSWORD).unwrap())
            .await
            .unwrap();
        let session_id = start_checkout(&h, "ada@example.com").await;

        let delivered = send(
            &h,
            signed_webhook(
                &completed_event("evt_1", &session_id, "ada@example.com"),
                WEBHOOK_SECRET,
            ),
        )
        .await;
        assert_eq!(delivered.status, StatusCode::OK);
        assert_eq!(delivered.body["result"], "processed");

        let done = send(&h, finalize(&session_id)).await;
        assert_eq!(done.status, StatusCode::OK);
        assert_eq!(done.body["status"], "completed");
        assert!(done.body["token"].is_string());
        assert!(done.refresh_cookie().is_some());
        assert_eq!(done.body["user"]["email"], "ada@example.com");
        assert_eq!(done.body["user"]["first_name"], "Ada");
        assert_eq!(done.body["user"]["last_name"], "Lovelace");
        assert_eq!(done.body["plan"]["code"], "hobby");
        assert_eq!(done.body["plan"]["currency"], "EUR");
        assert_eq!(done.body["plan"]["price_cents"], 450);
        assert_eq!(done.body["plan"]["daily_credit_quota"], 50);
        assert_eq!(done.body["credits"]["remaining_last_24h"], 50);
        assert!(done.body["subscription_id"].is_string());

        let session = h.store.checkout_get(&session_id).await.unwrap().unwrap();
        assert!(session.consumed_at.is_some());

        // The password from signup now works for login
        assert_eq!(login(&h, "ada@example.com").await.status, StatusCode::OK);

        // Credentials are handed out once per checkout
        let again = send(&h, finalize(&session_id)).await;
        assert_eq!(again.status, StatusCode::UNAUTHORIZED);
    }

    // =========================================================================
    // HTTP-C08: Concurrent finalize calls hand out credentials once
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_finalize_single_winner() {
        let h = harness().await;
        h.store
            .save_verified_signup("ada@example.com", "hash")
            .await
            .unwrap();
        let session_id = start_checkout(&h, "ada@example.com").await;
        send(
            &h,
            signed_webhook(
                &completed_event("evt_race", &session_id, "ada@example.com"),
                WEBHOOK_SECRET,
            ),
        )
        .await;

        let barrier = Arc::new(Barrier::new(6));
        let mut handles = vec![];
        for _ in 0..6 {
            let state = h.state.clone();
            let barrier = barrier.clone();
            let request = finalize(&session_id);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                create_router(state).oneshot(request).await.unwrap().status()
            }));
        }

        let mut statuses = vec![];
        for handle in handles {
            statuses.push(handle.await.unwrap());
        }
        let ok = statuses.iter().filter(|s| **s == StatusCode::OK).count();
        let refused = statuses
            .iter()
            .filter(|s| **s == StatusCode::UNAUTHORIZED)
            .count();
        assert_eq!(ok, 1);
        assert_eq!(refused, 5);
    }

    // =========================================================================
    // HTTP-C04: Redelivery is acknowledged without reprocessing
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_webhook() {
        let h = harness().await;
        h.store
            .save_verified_signup("ada@example.com", "hash")
            .await
            .unwrap();
        let session_id = start_checkout(&h, "ada@example.com").await;
        let event = completed_event("evt_dup", &session_id, "ada@example.com");

        let first = send(&h, signed_webhook(&event, WEBHOOK_SECRET)).await;
        let second = send(&h, signed_webhook(&event, WEBHOOK_SECRET)).await;
        assert_eq!(first.body["result"], "processed");
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.body["result"], "duplicate");

        let user = h
            .store
            .find_user_by_email("ada@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(h.store.current_subscription(user.id).await.unwrap().is_some());
    }

    // =========================================================================
    // HTTP-C05: Bad signatures are refused before anything is journaled
    // =========================================================================
    #[tokio::test]
    async fn test_webhook_signature_rejected() {
        let h = harness().await;
        let event = completed_event("evt_forged", "cs_x", "mallory@example.com");

        let forged = send(&h, signed_webhook(&event, "whsec_wrong")).await;
        assert_eq!(forged.status, StatusCode::BAD_REQUEST);

        let unsigned = send(&h, post_json("/api/stripe/webhook", event)).await;
        assert_eq!(unsigned.status, StatusCode::BAD_REQUEST);

        assert!(h.store.get_webhook_event("evt_forged").await.unwrap().is_none());
    }

    // =========================================================================
    // HTTP-C06: Processing failures are acknowledged and journaled
    // =========================================================================
    #[tokio::test]
    async fn test_failed_processing_is_acknowledged() {
        let h = harness().await;
        // No verified signup exists for this email
        let session_id = start_checkout(&h, "ghost@example.com").await;
        let event = completed_event("evt_ghost", &session_id, "ghost@example.com");

        let reply = send(&h, signed_webhook(&event, WEBHOOK_SECRET)).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["result"], "failed");

        let failed = h.state.billing.webhooks.list_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].event_id, "evt_ghost");

        let pending = send(&h, finalize(&session_id)).await;
        assert_eq!(pending.body["status"], "pending");
    }

    // =========================================================================
    // HTTP-C07: Expired sessions finalize as failed; cleanup spares them
    // =========================================================================
    #[tokio::test]
    async fn test_expired_session_and_cleanup() {
        let h = harness().await;
        let expired_id = start_checkout(&h, "late@example.com").await;
        let abandoned_id = start_checkout(&h, "gone@example.com").await;

        let event = json!({
            "id": "evt_expired",
            "type": "checkout.session.expired",
            "data": { "object": { "id": expired_id } }
        });
        let reply = send(&h, signed_webhook(&event, WEBHOOK_SECRET)).await;
        assert_eq!(reply.body["result"], "processed");

        let failed = send(&h, finalize(&expired_id)).await;
        assert_eq!(failed.body, json!({ "status": "failed", "reason": "expired" }));

        let cleanup = |id: &str| post_json("/api/stripe/cleanup", json!({ "sessionId": id }));
        let kept = send(&h, cleanup(&expired_id)).await;
        assert_eq!(kept.body["message"], "nothing_to_clean");
        assert!(h.store.checkout_get(&expired_id).await.unwrap().is_some());

        let cleaned = send(&h, cleanup(&abandoned_id)).await;
        assert_eq!(cleaned.status, StatusCode::OK);
        assert_eq!(cleaned.body["message"], "session_cleaned");
        assert!(h.store.checkout_get(&abandoned_id).await.unwrap().is_none());
    }
}

// =========================================================================
// Public routes
// =========================================================================
#[tokio::test]
async fn test_public_routes() {
    let h = harness().await;

    let health = send(&h, get("/health")).await;
    assert_eq!(health.status, StatusCode::OK);

    let plans = send(&h, get("/api/plans")).await;
    assert_eq!(plans.status, StatusCode::OK);
    let codes: Vec<&str> = plans.body["plans"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["free", "hobby", "pro"]);
    assert_eq!(plans.body["plans"][1]["prices"]["EUR"], 450);
}
