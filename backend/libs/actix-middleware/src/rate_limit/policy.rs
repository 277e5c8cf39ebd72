use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderMap, HeaderName, HeaderValue},
    Error,
};
use error_types::AppError;
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{
    principal_for, ClientIpResolver, RateLimitMode, RateLimitOutcome, RateLimiter, HEADER_LIMIT,
    HEADER_MODE, HEADER_REMAINING, HEADER_RESET,
};
use crate::context::request_id_of;
use crate::metrics::RATE_LIMIT_DECISIONS_TOTAL;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Which budgets a route is subject to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// `api:minute:<principal>` then `api:hour:<principal>`.
    Api { per_minute: u64, per_hour: u64 },
    /// `endpoint:<METHOD>:<route pattern>:<principal>`.
    Endpoint { limit: u64, window: Duration },
    /// `ratelimit:auth:<principal>`.
    Auth { limit: u64, window: Duration },
}

impl RateLimitPolicy {
    pub fn api(per_minute: u64, per_hour: u64) -> Self {
        RateLimitPolicy::Api {
            per_minute,
            per_hour,
        }
    }

    pub fn endpoint(limit: u64, window: Duration) -> Self {
        RateLimitPolicy::Endpoint { limit, window }
    }

    pub fn auth(limit: u64, window: Duration) -> Self {
        RateLimitPolicy::Auth { limit, window }
    }

    pub fn scope(&self) -> &'static str {
        match self {
            RateLimitPolicy::Api { .. } => "api",
            RateLimitPolicy::Endpoint { .. } => "endpoint",
            RateLimitPolicy::Auth { .. } => "auth",
        }
    }

    /// `(key, limit, window)` checks in evaluation order.
    fn checks(&self, req: &ServiceRequest, principal: &str) -> Vec<(String, u64, Duration)> {
        match self {
            RateLimitPolicy::Api {
                per_minute,
                per_hour,
            } => vec![
                (format!("api:minute:{principal}"), *per_minute, MINUTE),
                (format!("api:hour:{principal}"), *per_hour, HOUR),
            ],
            RateLimitPolicy::Endpoint { limit, window } => {
                let route = req
                    .match_pattern()
                    .unwrap_or_else(|| req.path().to_string());
                vec![(
                    format!("endpoint:{}:{}:{}", req.method(), route, principal),
                    *limit,
                    *window,
                )]
            }
            RateLimitPolicy::Auth { limit, window } => {
                vec![(format!("ratelimit:auth:{principal}"), *limit, *window)]
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Write the `X-RateLimit-*` headers for `outcome`.
pub(crate) fn apply_headers(headers: &mut HeaderMap, outcome: &RateLimitOutcome) {
    let decision = &outcome.decision;
    insert_header(headers, HEADER_LIMIT, decision.limit);
    insert_header(headers, HEADER_REMAINING, decision.remaining);
    insert_header(headers, HEADER_RESET, unix_now() + decision.retry_after_secs());
    if outcome.mode == RateLimitMode::Fallback {
        insert_header(headers, HEADER_MODE, RateLimitMode::Fallback.as_str());
    }
}

/// Rate limiting middleware for one policy.
#[derive(Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    policy: RateLimitPolicy,
    resolver: Arc<ClientIpResolver>,
}

impl RateLimitMiddleware {
    pub fn new(
        limiter: Arc<RateLimiter>,
        policy: RateLimitPolicy,
        resolver: Arc<ClientIpResolver>,
    ) -> Self {
        Self {
            limiter,
            policy,
            resolver,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddlewareService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
            policy: self.policy.clone(),
            resolver: self.resolver.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: Rc<S>,
    limiter: Arc<RateLimiter>,
    policy: RateLimitPolicy,
    resolver: Arc<ClientIpResolver>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let limiter = self.limiter.clone();
        let scope = self.policy.scope();
        let principal = principal_for(&req, &self.resolver);
        let checks = self.policy.checks(&req, &principal);

        Box::pin(async move {
            // Headers describe the check closest to exhaustion.
            let mut reported: Option<RateLimitOutcome> = None;

            for (key, limit, window) in checks {
                let outcome = limiter.check(&key, limit, window).await;
                let result = if outcome.decision.allowed {
                    "allowed"
                } else {
                    "rejected"
                };
                RATE_LIMIT_DECISIONS_TOTAL
                    .with_label_values(&[scope, outcome.mode.as_str(), result])
                    .inc();

                if !outcome.decision.allowed {
                    let retry_after = outcome.decision.retry_after_secs();
                    tracing::warn!(
                        key = %key,
                        limit,
                        retry_after,
                        mode = outcome.mode.as_str(),
                        "Rate limit exceeded"
                    );

                    let request_id = request_id_of(&req);
                    let mut response = AppError::rate_limited(retry_after).render(&request_id, false);
                    apply_headers(response.headers_mut(), &outcome);
                    return Ok(req.into_response(response).map_into_right_body());
                }

                if reported.map_or(true, |r| outcome.decision.remaining < r.decision.remaining) {
                    reported = Some(outcome);
                }
            }

            let mut res = service.call(req).await?;
            if let Some(outcome) = reported {
                apply_headers(res.headers_mut(), &outcome);
            }
            Ok(res.map_into_left_body())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::InMemoryRateLimiter;
    use actix_web::{test, web, App, HttpResponse};
    use serde_json::Value;

    async fn ok() -> HttpResponse {
        HttpResponse::Ok().body("ok")
    }

    fn local_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::local(Arc::new(InMemoryRateLimiter::new())))
    }

    #[actix_web::test]
    async fn test_api_policy_rejects_after_limit() {
        let app = test::init_service(
            App::new()
                .wrap(RateLimitMiddleware::new(
                    local_limiter(),
                    RateLimitPolicy::api(3, 100),
                    Arc::new(ClientIpResolver::default()),
                ))
                .route("/", web::get().to(ok)),
        )
        .await;

        for expected in ["2", "1", "0"] {
            let req = test::TestRequest::get()
                .uri("/")
                .peer_addr("10.0.0.1:1234".parse().unwrap())
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), 200);
            assert_eq!(resp.headers().get(HEADER_REMAINING).unwrap(), expected);
            assert_eq!(resp.headers().get(HEADER_LIMIT).unwrap(), "3");
        }

        let req = test::TestRequest::get()
            .uri("/")
            .peer_addr("10.0.0.1:1234".parse().unwrap())
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 429);
        assert_eq!(resp.headers().get(HEADER_REMAINING).unwrap(), "0");
        let retry: u64 = resp
            .headers()
            .get("retry-after")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry));

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "rate_limit_exceeded");
        assert_eq!(body["error"]["retry_after"], retry);
    }

    #[actix_web::test]
    async fn test_principals_are_isolated() {
        let app = test::init_service(
            App::new()
                .wrap(RateLimitMiddleware::new(
                    local_limiter(),
                    RateLimitPolicy::auth(1, MINUTE),
                    Arc::new(ClientIpResolver::default()),
                ))
                .route("/", web::get().to(ok)),
        )
        .await;

        for addr in ["10.0.0.1:1", "10.0.0.2:1"] {
            let req = test::TestRequest::get()
                .uri("/")
                .peer_addr(addr.parse().unwrap())
                .to_request();
            assert_eq!(test::call_service(&app, req).await.status(), 200);
        }
    }

    #[actix_web::test]
    async fn test_endpoint_key_uses_route_pattern() {
        let req = test::TestRequest::post()
            .uri("/v1/trips/abc/members")
            .to_srv_request();
        let checks = RateLimitPolicy::endpoint(5, MINUTE).checks(&req, "user:u1");
        assert_eq!(checks.len(), 1);
        assert!(checks[0].0.starts_with("endpoint:POST:"));
        assert!(checks[0].0.ends_with(":user:u1"));
    }

    #[actix_web::test]
    async fn test_api_keys() {
        let req = test::TestRequest::get().to_srv_request();
        let checks = RateLimitPolicy::api(60, 1000).checks(&req, "ip:1.2.3.4");
        assert_eq!(checks[0], ("api:minute:ip:1.2.3.4".to_string(), 60, MINUTE));
        assert_eq!(checks[1], ("api:hour:ip:1.2.3.4".to_string(), 1000, HOUR));
    }
}
