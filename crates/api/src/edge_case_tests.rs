// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the HTTP surface
//!
//! Drives the full router with an in-memory credit store:
//! - Entitlement guard (API-E01 to API-E05)
//! - Metered features (API-F01 to API-F05)
//! - Accounts (API-A01 to API-A03)
//! - Stripe webhook endpoint (API-W01 to API-W04)

#[cfg(test)]
mod harness {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{header, Request},
        response::Response,
        Router,
    };
    use revisume_billing::{
        BillingService, CreditEngine, MemoryCreditStore, PriceIds, StripeConfig, TestClock,
        TierPolicy,
    };
    use revisume_shared::{SubscriptionTier, User, UserId};
    use time::macros::datetime;
    use time::OffsetDateTime;

    use crate::{create_router, AppState, Config, StoreBackend};

    pub use revisume_billing::CreditStore;

    pub const JWT_SECRET: &str = "test-secret-key-at-least-32-chars!";
    pub const WEBHOOK_SECRET: &str = "whsec_api_tests";
    pub const NOW: OffsetDateTime = datetime!(2025-07-05 12:00 UTC);

    pub struct TestApp {
        pub router: Router,
        pub state: AppState,
        pub store: MemoryCreditStore,
    }

    pub fn config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            database_url: None,
            credit_store: StoreBackend::Memory,
            run_migrations: false,
            jwt_secret: JWT_SECRET.to_string(),
            jwt_expiry_hours: 24,
            allowed_origins: vec![],
            enable_billing: false,
        }
    }

    pub fn app(with_billing: bool) -> TestApp {
        let store = MemoryCreditStore::new();
        let clock = Arc::new(TestClock::new(NOW));
        let engine = CreditEngine::new(Arc::new(store.clone()), TierPolicy::default(), clock);

        let billing = with_billing.then(|| {
            Arc::new(BillingService::new(
                &engine,
                StripeConfig {
                    secret_key: String::new(),
                    webhook_secret: WEBHOOK_SECRET.to_string(),
                    price_ids: PriceIds {
                        starter: "price_starter".to_string(),
                        pro: "price_pro".to_string(),
                        credit_pack: "price_pack".to_string(),
                    },
                    credit_pack_size: 5,
                    success_url: "http://localhost/success".to_string(),
                    cancel_url: "http://localhost/cancel".to_string(),
                },
            ))
        });

        let state = AppState::with_billing(engine, config(), billing);
        TestApp {
            router: create_router(state.clone()),
            state,
            store,
        }
    }

    pub fn user(id: i64, tier: SubscriptionTier) -> User {
        User {
            id: UserId(id),
            email: format!("user{}@example.com", id),
            username: format!("user{}", id),
            password_hash: String::new(),
            tier,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            created_at: NOW,
        }
    }

    impl TestApp {
        pub fn token_for(&self, user_id: i64) -> String {
            let (token, _) = self
                .state
                .jwt_manager
                .generate_access_token(UserId(user_id), "user@example.com")
                .unwrap();
            token
        }

        pub async fn send(&self, request: Request<Body>) -> Response {
            use tower::ServiceExt;
            self.router.clone().oneshot(request).await.unwrap()
        }

        pub async fn post_as(&self, user_id: i64, uri: &str) -> Response {
            let request = Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", self.token_for(user_id)))
                .body(Body::empty())
                .unwrap();
            self.send(request).await
        }

        pub async fn get_page_as(&self, user_id: i64, uri: &str) -> Response {
            let request = Request::builder()
                .method("GET")
                .uri(uri)
                .header(
                    header::COOKIE,
                    format!("theme=dark; revisume_auth_token={}", self.token_for(user_id)),
                )
                .body(Body::empty())
                .unwrap();
            self.send(request).await
        }
    }

    pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}

#[cfg(test)]
mod entitlement_tests {
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use revisume_shared::{CreditType, SubscriptionTier, UserId};

    use super::harness::*;

    // =========================================================================
    // API-E01: Free user on a starter/pro API path - 403 JSON
    // =========================================================================
    #[tokio::test]
    async fn test_free_user_api_path_gets_403_json() {
        let app = app(false);
        app.store.seed_user(user(1, SubscriptionTier::Free)).await;

        let response = app.post_as(1, "/api/v1/resume/recommendations").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = json_body(response).await;
        assert_eq!(body["code"], 403);
        assert!(body["error"].as_str().unwrap().contains("tier required"));
        assert!(app.store.list_usage(UserId(1)).await.unwrap().is_empty());
    }

    // =========================================================================
    // API-E02: Free user on a starter/pro HTML page - 302 home with flash
    // =========================================================================
    #[tokio::test]
    async fn test_free_user_html_path_redirects_with_flash() {
        let app = app(false);
        app.store.seed_user(user(1, SubscriptionTier::Free)).await;

        let response = app.get_page_as(1, "/cover-letters/generate").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("flash="));
    }

    // =========================================================================
    // API-E03: Starter user reaches the page
    // =========================================================================
    #[tokio::test]
    async fn test_starter_user_sees_page() {
        let app = app(false);
        app.store.seed_user(user(2, SubscriptionTier::Starter)).await;
        app.store
            .seed_credit(UserId(2), CreditType::CoverLetterAi, 3, Some(NOW))
            .await;

        let response = app.get_page_as(2, "/cover-letters/generate").await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("AI generations left this month: 3"));
    }

    // =========================================================================
    // API-E04: Missing credentials - 401 JSON on API, redirect on pages
    // =========================================================================
    #[tokio::test]
    async fn test_missing_auth() {
        let app = app(false);

        let api = app
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/cover-letters")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(api.status(), StatusCode::UNAUTHORIZED);

        let page = app
            .send(
                Request::builder()
                    .uri("/cover-letters/generate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(page.status(), StatusCode::FOUND);
    }

    // =========================================================================
    // API-E05: Tier is read per request, so a downgrade applies immediately
    // =========================================================================
    #[tokio::test]
    async fn test_token_does_not_pin_tier() {
        let app = app(false);
        let mut pro = user(3, SubscriptionTier::Pro);
        pro.stripe_subscription_id = Some("sub_3".to_string());
        app.store.seed_user(pro).await;
        let token = app.token_for(3);

        let mut downgraded = user(3, SubscriptionTier::Free);
        downgraded.stripe_subscription_id = Some("sub_3".to_string());
        app.store.seed_user(downgraded).await;

        let response = app
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/insights/job-market")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}

#[cfg(test)]
mod feature_tests {
    use axum::http::StatusCode;
    use revisume_shared::{CreditType, SubscriptionTier, UserId};
    use time::macros::datetime;

    use super::harness::*;

    // =========================================================================
    // API-F01: Starter consumption reports the remaining balance
    // =========================================================================
    #[tokio::test]
    async fn test_starter_consumes_quota() {
        let app = app(false);
        app.store.seed_user(user(1, SubscriptionTier::Starter)).await;
        app.store
            .seed_credit(UserId(1), CreditType::ResumeAi, 10, Some(NOW))
            .await;

        let response = app.post_as(1, "/api/v1/resume/recommendations").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["feature"], "resume_recommendations");
        assert_eq!(body["credit_type"], "resume_ai");
        assert_eq!(body["credits_used"], 1);
        assert_eq!(body["remaining"], 9);
    }

    // =========================================================================
    // API-F02: Stale starter balance is refilled before consumption
    // =========================================================================
    #[tokio::test]
    async fn test_stale_balance_refilled_on_consume() {
        let app = app(false);
        app.store.seed_user(user(1, SubscriptionTier::Starter)).await;
        app.store
            .seed_credit(
                UserId(1),
                CreditType::DeepDive,
                0,
                Some(datetime!(2025-06-10 0:00 UTC)),
            )
            .await;

        let response = app.post_as(1, "/api/v1/insights/job-market").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["remaining"], 0);

        let again = app.post_as(1, "/api/v1/insights/job-market").await;
        assert_eq!(again.status(), StatusCode::PAYMENT_REQUIRED);
    }

    // =========================================================================
    // API-F03: Free legacy flow - pack balance spent, then 402
    // =========================================================================
    #[tokio::test]
    async fn test_free_user_legacy_flow() {
        let app = app(false);
        app.store.seed_user(user(1, SubscriptionTier::Free)).await;
        app.store
            .seed_credit(UserId(1), CreditType::Legacy, 1, None)
            .await;

        let first = app.post_as(1, "/api/v1/mock-interviews").await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.post_as(1, "/api/v1/cover-letters").await;
        assert_eq!(second.status(), StatusCode::PAYMENT_REQUIRED);
        let body = json_body(second).await;
        assert_eq!(body["code"], 402);
        assert_eq!(body["available"], 0);

        let usage = app.store.list_usage(UserId(1)).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].feature_name, "new_mock_interview");
    }

    // =========================================================================
    // API-F04: Pro is unlimited and logs zero-credit usage
    // =========================================================================
    #[tokio::test]
    async fn test_pro_is_unlimited() {
        let app = app(false);
        let mut pro = user(1, SubscriptionTier::Pro);
        pro.stripe_customer_id = Some("cus_1".to_string());
        pro.stripe_subscription_id = Some("sub_1".to_string());
        app.store.seed_user(pro).await;

        let response = app.post_as(1, "/api/v1/cover-letters/generate").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["credits_used"], 0);
        assert!(body["remaining"].is_null());

        let usage = app.store.list_usage(UserId(1)).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].credits_used, 0);
        assert!(app.store.list_credits(UserId(1)).await.unwrap().is_empty());
    }

    // =========================================================================
    // API-F05: Storage failure during consumption - 503, not 402
    // =========================================================================
    #[tokio::test]
    async fn test_storage_failure_is_unavailable() {
        let app = app(false);
        app.store.seed_user(user(1, SubscriptionTier::Starter)).await;
        app.store
            .seed_credit(UserId(1), CreditType::ResumeAi, 10, Some(NOW))
            .await;

        app.store.fail_next_commit();
        let failed = app.post_as(1, "/api/v1/resume/recommendations").await;
        assert_eq!(failed.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(failed).await["code"], 503);
        assert!(app.store.list_usage(UserId(1)).await.unwrap().is_empty());

        let retried = app.post_as(1, "/api/v1/resume/recommendations").await;
        assert_eq!(retried.status(), StatusCode::OK);
        assert_eq!(json_body(retried).await["remaining"], 9);
    }
}

#[cfg(test)]
mod account_tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use super::harness::*;

    // =========================================================================
    // API-A01: Registration creates a free user with zeroed rows
    // =========================================================================
    #[tokio::test]
    async fn test_register_and_duplicate() {
        let app = app(false);
        let payload = json!({
            "email": "New@Example.com",
            "username": "newbie",
            "password": "correct horse",
        });

        let created = app
            .send(json_request("POST", "/api/v1/auth/register", payload.clone()))
            .await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let body = json_body(created).await;
        assert_eq!(body["user"]["tier"], "free");
        assert_eq!(body["user"]["email"], "new@example.com");
        assert!(body["user"].get("password_hash").is_none());
        assert!(body["access_token"].as_str().is_some());

        let duplicate = app
            .send(json_request("POST", "/api/v1/auth/register", payload))
            .await;
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    }

    // =========================================================================
    // API-A02: Login rejects a wrong password, accepts the right one
    // =========================================================================
    #[tokio::test]
    async fn test_login() {
        let app = app(false);
        app.send(json_request(
            "POST",
            "/api/v1/auth/register",
            json!({ "email": "a@example.com", "username": "a", "password": "password123" }),
        ))
        .await;

        let wrong = app
            .send(json_request(
                "POST",
                "/api/v1/auth/login",
                json!({ "email": "a@example.com", "password": "password124" }),
            ))
            .await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = app
            .send(json_request(
                "POST",
                "/api/v1/auth/login",
                json!({ "email": "A@example.com", "password": "password123" }),
            ))
            .await;
        assert_eq!(ok.status(), StatusCode::OK);
        let token = json_body(ok).await["access_token"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(app.state.jwt_manager.validate_token(&token).is_ok());
    }

    // =========================================================================
    // API-A03: Weak password and malformed email are rejected
    // =========================================================================
    #[tokio::test]
    async fn test_register_validation() {
        let app = app(false);
        let weak = app
            .send(json_request(
                "POST",
                "/api/v1/auth/register",
                json!({ "email": "b@example.com", "username": "b", "password": "short" }),
            ))
            .await;
        assert_eq!(weak.status(), StatusCode::BAD_REQUEST);

        let bad_email = app
            .send(json_request(
                "POST",
                "/api/v1/auth/register",
                json!({ "email": "nope", "username": "c", "password": "long enough" }),
            ))
            .await;
        assert_eq!(bad_email.status(), StatusCode::BAD_REQUEST);
    }
}

#[cfg(test)]
mod webhook_tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use revisume_billing::compute_signature;
    use revisume_shared::{CreditType, SubscriptionTier, UserId};

    use super::harness::*;
    use crate::routes::webhooks::STRIPE_SIGNATURE_HEADER;

    fn pack_payload(event_id: &str, user_id: i64) -> String {
        serde_json::json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_test",
                "mode": "payment",
                "client_reference_id": user_id.to_string(),
                "metadata": { "price_id": "price_pack" },
            }},
        })
        .to_string()
    }

    fn signed(payload: &str) -> Request<Body> {
        let ts = NOW.unix_timestamp();
        let signature = compute_signature(WEBHOOK_SECRET, ts, payload).unwrap();
        Request::builder()
            .method("POST")
            .uri("/stripe_webhook")
            .header(STRIPE_SIGNATURE_HEADER, format!("t={},v1={}", ts, signature))
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    // =========================================================================
    // API-W01: Valid signed event is applied and acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_signed_event_applied() {
        let app = app(true);
        app.store.seed_user(user(42, SubscriptionTier::Free)).await;
        app.store
            .seed_credit(UserId(42), CreditType::Legacy, 2, None)
            .await;

        let response = app.send(signed(&pack_payload("evt_1", 42))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["outcome"]["status"], "processed");

        let credit = app
            .store
            .find_credit(UserId(42), &CreditType::Legacy)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credit.amount, 7);

        let replay = app.send(signed(&pack_payload("evt_1", 42))).await;
        assert_eq!(replay.status(), StatusCode::OK);
        assert_eq!(json_body(replay).await["outcome"]["status"], "duplicate");
    }

    // =========================================================================
    // API-W02: Bad or missing signatures - 400, nothing applied
    // =========================================================================
    #[tokio::test]
    async fn test_invalid_signature_rejected() {
        let app = app(true);
        app.store.seed_user(user(42, SubscriptionTier::Free)).await;
        let payload = pack_payload("evt_2", 42);

        let tampered = Request::builder()
            .method("POST")
            .uri("/stripe_webhook")
            .header(
                STRIPE_SIGNATURE_HEADER,
                format!("t={},v1={}", NOW.unix_timestamp(), "ab".repeat(32)),
            )
            .body(Body::from(payload.clone()))
            .unwrap();
        assert_eq!(app.send(tampered).await.status(), StatusCode::BAD_REQUEST);

        let unsigned = Request::builder()
            .method("POST")
            .uri("/stripe_webhook")
            .body(Body::from(payload))
            .unwrap();
        assert_eq!(app.send(unsigned).await.status(), StatusCode::BAD_REQUEST);

        assert!(app.store.list_credits(UserId(42)).await.unwrap().is_empty());
        assert_eq!(app.store.processed_event_count().await, 0);
    }

    // =========================================================================
    // API-W03: Storage failure - 500 so Stripe redelivers
    // =========================================================================
    #[tokio::test]
    async fn test_storage_failure_requests_retry() {
        let app = app(true);
        app.store.seed_user(user(42, SubscriptionTier::Free)).await;

        app.store.fail_next_commit();
        let failed = app.send(signed(&pack_payload("evt_3", 42))).await;
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(app.store.list_credits(UserId(42)).await.unwrap().is_empty());

        let retried = app.send(signed(&pack_payload("evt_3", 42))).await;
        assert_eq!(retried.status(), StatusCode::OK);
    }

    // =========================================================================
    // API-W04: Billing disabled - webhook and checkout are unavailable
    // =========================================================================
    #[tokio::test]
    async fn test_billing_not_configured() {
        let app = app(false);
        app.store.seed_user(user(1, SubscriptionTier::Free)).await;

        let webhook = app.send(signed(&pack_payload("evt_4", 1))).await;
        assert_eq!(webhook.status(), StatusCode::SERVICE_UNAVAILABLE);

        let mut checkout = json_request(
            "POST",
            "/api/v1/billing/checkout",
            serde_json::json!({ "product": "starter" }),
        );
        checkout.headers_mut().insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", app.token_for(1)).parse().unwrap(),
        );
        assert_eq!(
            app.send(checkout).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
