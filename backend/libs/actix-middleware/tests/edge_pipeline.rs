//! Full edge chain: request ID, error envelope, auth gate and rate limits.

use actix_middleware::rate_limit::{RateLimitDecision, RateLimitError, RateLimiterBackend};
use actix_middleware::{
    AuthGate, ClientIpResolver, ErrorEnvelope, InMemoryRateLimiter, RateLimitMiddleware,
    RateLimitPolicy, RateLimiter, RequestId, UserId,
};
use actix_web::{test, web, App, HttpResponse};
use async_trait::async_trait;
use jwt_security::test_utils::{expired_token, valid_token, TEST_HS_SECRET};
use jwt_security::{JwtValidator, TokenValidator};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Distributed backend that is down.
struct DeadBackend;

#[async_trait]
impl RateLimiterBackend for DeadBackend {
    async fn check_limit(
        &self,
        _key: &str,
        _limit: u64,
        _window: Duration,
    ) -> Result<RateLimitDecision, RateLimitError> {
        Err(RateLimitError::Backend("connection refused".into()))
    }

    async fn release(&self, _key: &str) -> Result<(), RateLimitError> {
        Err(RateLimitError::Backend("connection refused".into()))
    }
}

async fn whoami(user: UserId) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "user_id": user.as_str() }))
}

fn validator() -> Arc<dyn TokenValidator> {
    Arc::new(JwtValidator::new(Some(TEST_HS_SECRET), None))
}

#[actix_rt::test]
async fn test_expired_token_gets_refresh_envelope() {
    let app = test::init_service(
        App::new()
            .wrap(ErrorEnvelope::new(false))
            .wrap(RequestId)
            .service(
                web::scope("/v1")
                    .wrap(AuthGate::new(validator()))
                    .route("/trips/{id}", web::get().to(whoami)),
            ),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/v1/trips/T1")
        .insert_header(("Authorization", format!("Bearer {}", expired_token("U1"))))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 401);
    let request_id = resp
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "token_expired");
    assert_eq!(body["error"]["refresh_required"], true);
    assert_eq!(body["meta"]["requestID"], request_id.as_str());
}

#[actix_rt::test]
async fn test_valid_token_reaches_handler() {
    let app = test::init_service(
        App::new()
            .wrap(ErrorEnvelope::new(false))
            .wrap(RequestId)
            .service(
                web::scope("/v1")
                    .wrap(AuthGate::new(validator()))
                    .route("/trips/{id}", web::get().to(whoami)),
            ),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/v1/trips/T1")
        .insert_header(("Authorization", format!("Bearer {}", valid_token("U1"))))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["user_id"], "U1");
}

#[actix_rt::test]
async fn test_user_burst_rejects_61st_request() {
    let limiter = Arc::new(RateLimiter::local(Arc::new(InMemoryRateLimiter::new())));
    // The auth gate is applied last so it runs before the limiter.
    let app = test::init_service(
        App::new()
            .wrap(ErrorEnvelope::new(false))
            .wrap(RequestId)
            .service(
                web::scope("/v1")
                    .wrap(RateLimitMiddleware::new(
                        limiter,
                        RateLimitPolicy::api(60, 1000),
                        Arc::new(ClientIpResolver::default()),
                    ))
                    .wrap(AuthGate::new(validator()))
                    .route("/trips/{id}", web::get().to(whoami)),
            ),
    )
    .await;

    let token = valid_token("U1");
    for _ in 0..60 {
        let req = test::TestRequest::get()
            .uri("/v1/trips/T1")
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 200);
    }

    let req = test::TestRequest::get()
        .uri("/v1/trips/T1")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 429);
    assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "0");
    let retry_after: u64 = resp
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");
    assert!(!body["meta"]["requestID"].as_str().unwrap().is_empty());
}

#[actix_rt::test]
async fn test_dead_backend_still_enforces_auth_limit() {
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(DeadBackend),
        Arc::new(InMemoryRateLimiter::new()),
    ));
    let app = test::init_service(
        App::new()
            .wrap(ErrorEnvelope::new(false))
            .wrap(RequestId)
            .service(
                web::scope("/v1/auth")
                    .wrap(RateLimitMiddleware::new(
                        limiter,
                        RateLimitPolicy::auth(3, Duration::from_secs(60)),
                        Arc::new(ClientIpResolver::default()),
                    ))
                    .route("/login", web::post().to(|| async { HttpResponse::Ok().finish() })),
            ),
    )
    .await;

    let mut statuses = Vec::new();
    for _ in 0..5 {
        let req = test::TestRequest::post()
            .uri("/v1/auth/login")
            .peer_addr("10.0.0.1:50000".parse().unwrap())
            .to_request();
        let resp = test::call_service(&app, req).await;
        if resp.status() == 429 {
            assert_eq!(resp.headers().get("x-ratelimit-mode").unwrap(), "fallback");
        }
        statuses.push(resp.status().as_u16());
    }

    assert_eq!(statuses, vec![200, 200, 200, 429, 429]);
}
