use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header::RETRY_AFTER, StatusCode},
    Error, HttpMessage, HttpResponse,
};
use error_types::{error_codes, AppError, ErrorResponse};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::policy::apply_headers;
use super::{RateLimitMode, RateLimiter};
use crate::context::{request_id_of, RequestContext};
use crate::metrics::RATE_LIMIT_DECISIONS_TOTAL;

struct PermitInner {
    limiter: Arc<RateLimiter>,
    key: String,
    mode: RateLimitMode,
    released: AtomicBool,
}

impl Drop for PermitInner {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        // Last handle dropped without an explicit release.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let limiter = self.limiter.clone();
            let key = std::mem::take(&mut self.key);
            let mode = self.mode;
            handle.spawn(async move {
                limiter.release(&key, mode).await;
            });
        } else {
            tracing::warn!(key = %self.key, "Dropped WebSocket permit outside a runtime, slot expires with its window");
        }
    }
}

/// One admitted WebSocket connection on `ws_conn:<sub>`.
///
/// Clones share the slot; the first `release` wins.
#[derive(Clone)]
pub struct WsConnectionPermit {
    inner: Arc<PermitInner>,
}

impl WsConnectionPermit {
    fn new(limiter: Arc<RateLimiter>, key: String, mode: RateLimitMode) -> Self {
        Self {
            inner: Arc::new(PermitInner {
                limiter,
                key,
                mode,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub async fn release(&self) {
        if self
            .inner
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner
                .limiter
                .release(&self.inner.key, self.inner.mode)
                .await;
        }
    }
}

/// Caps concurrent WebSocket connections per authenticated user.
///
/// Must run inside the auth gate. A permit is placed in the request
/// extensions and released again unless the response is `101`.
#[derive(Clone)]
pub struct WsConnectionLimit {
    limiter: Arc<RateLimiter>,
    max_connections: u64,
    window: Duration,
}

impl WsConnectionLimit {
    pub fn new(limiter: Arc<RateLimiter>, max_connections: u64, window: Duration) -> Self {
        Self {
            limiter,
            max_connections,
            window,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for WsConnectionLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = WsConnectionLimitService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(WsConnectionLimitService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
            max_connections: self.max_connections,
            window: self.window,
        }))
    }
}

pub struct WsConnectionLimitService<S> {
    service: Rc<S>,
    limiter: Arc<RateLimiter>,
    max_connections: u64,
    window: Duration,
}

impl<S, B> Service<ServiceRequest> for WsConnectionLimitService<S>
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
        let max_connections = self.max_connections;
        let window = self.window;

        Box::pin(async move {
            let user_id = RequestContext::of(&req).and_then(|ctx| ctx.user_id().map(str::to_string));
            let Some(user_id) = user_id else {
                let response = AppError::unauthorized(
                    error_codes::UNAUTHORIZED,
                    "Authentication required",
                )
                .render(&request_id_of(&req), false);
                return Ok(req.into_response(response).map_into_right_body());
            };

            let key = format!("ws_conn:{user_id}");
            let outcome = limiter.check(&key, max_connections, window).await;
            let result = if outcome.decision.allowed {
                "allowed"
            } else {
                "rejected"
            };
            RATE_LIMIT_DECISIONS_TOTAL
                .with_label_values(&["ws_conn", outcome.mode.as_str(), result])
                .inc();

            if !outcome.decision.allowed {
                // The rejected attempt was counted too.
                limiter.release(&key, outcome.mode).await;
                let retry_after = outcome.decision.retry_after_secs();
                tracing::warn!(
                    user_id = %user_id,
                    max_connections,
                    mode = outcome.mode.as_str(),
                    "WebSocket connection limit reached"
                );

                let mut body = ErrorResponse::new(
                    error_codes::TOO_MANY_CONNECTIONS,
                    "Too many concurrent WebSocket connections",
                )
                .with_request_id(&request_id_of(&req));
                body.error.retry_after = Some(retry_after);

                let mut response = HttpResponse::TooManyRequests()
                    .insert_header((RETRY_AFTER, retry_after))
                    .json(body);
                apply_headers(response.headers_mut(), &outcome);
                return Ok(req.into_response(response).map_into_right_body());
            }

            let permit = WsConnectionPermit::new(limiter, key, outcome.mode);
            req.extensions_mut().insert(permit.clone());

            match service.call(req).await {
                Ok(res) => {
                    if res.status() != StatusCode::SWITCHING_PROTOCOLS {
                        permit.release().await;
                    }
                    Ok(res.map_into_left_body())
                }
                Err(e) => {
                    permit.release().await;
                    Err(e)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AuthenticatedUser;
    use crate::rate_limit::InMemoryRateLimiter;
    use actix_web::{test, web, App, HttpRequest};
    use serde_json::{Map, Value};
    use std::sync::Mutex;

    type Held = web::Data<Mutex<Vec<WsConnectionPermit>>>;

    fn user(id: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: id.to_string(),
            email: None,
            username: None,
            role: None,
            is_admin: false,
            claims: Map::new(),
        }
    }

    // Keeping the permit stands in for a live session.
    async fn upgraded(req: HttpRequest, held: Held) -> HttpResponse {
        if let Some(permit) = req.extensions().get::<WsConnectionPermit>() {
            held.lock().unwrap().push(permit.clone());
        }
        HttpResponse::SwitchingProtocols().finish()
    }

    async fn refused() -> HttpResponse {
        HttpResponse::BadRequest().finish()
    }

    #[actix_web::test]
    async fn test_limit_and_release_on_failed_upgrade() {
        let fallback = Arc::new(InMemoryRateLimiter::new());
        let limiter = Arc::new(RateLimiter::local(fallback.clone()));
        let held: Held = web::Data::new(Mutex::new(Vec::new()));
        let app = test::init_service(
            App::new()
                .app_data(held.clone())
                .wrap(WsConnectionLimit::new(limiter, 2, Duration::from_secs(3600)))
                .wrap_fn(|req, srv| {
                    RequestContext::attach_user(&req, user("u1"));
                    srv.call(req)
                })
                .route("/ws", web::get().to(upgraded))
                .route("/refused", web::get().to(refused)),
        )
        .await;

        for _ in 0..3 {
            let req = test::TestRequest::get().uri("/refused").to_request();
            assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
        }
        assert!(fallback.is_empty());

        for _ in 0..2 {
            let req = test::TestRequest::get().uri("/ws").to_request();
            assert_eq!(
                test::call_service(&app, req).await.status(),
                StatusCode::SWITCHING_PROTOCOLS
            );
        }

        let req = test::TestRequest::get().uri("/ws").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("retry-after"));
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "too_many_connections");

        // Closing one session frees a slot.
        let permit = held.lock().unwrap().pop().unwrap();
        permit.release().await;
        let req = test::TestRequest::get().uri("/ws").to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::SWITCHING_PROTOCOLS
        );
    }

    #[actix_web::test]
    async fn test_requires_authenticated_user() {
        let limiter = Arc::new(RateLimiter::local(Arc::new(InMemoryRateLimiter::new())));
        let held: Held = web::Data::new(Mutex::new(Vec::new()));
        let app = test::init_service(
            App::new()
                .app_data(held)
                .wrap(WsConnectionLimit::new(limiter, 2, Duration::from_secs(60)))
                .route("/ws", web::get().to(upgraded)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/ws").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_permit_release_is_idempotent() {
        let fallback = Arc::new(InMemoryRateLimiter::new());
        let limiter = Arc::new(RateLimiter::local(fallback.clone()));
        let window = Duration::from_secs(60);

        limiter.check("ws_conn:u1", 5, window).await;
        limiter.check("ws_conn:u1", 5, window).await;

        let permit = WsConnectionPermit::new(limiter.clone(), "ws_conn:u1".into(), RateLimitMode::Fallback);
        let clone = permit.clone();
        permit.release().await;
        clone.release().await;
        assert!(clone.is_released());

        // One of the two admissions remains: a single slot is left under a cap of two.
        assert!(limiter.check("ws_conn:u1", 2, window).await.decision.allowed);
        assert!(!limiter.check("ws_conn:u1", 2, window).await.decision.allowed);
    }

    #[tokio::test]
    async fn test_dropped_permit_releases_slot() {
        let fallback = Arc::new(InMemoryRateLimiter::new());
        let limiter = Arc::new(RateLimiter::local(fallback.clone()));

        limiter.check("ws_conn:u2", 5, Duration::from_secs(60)).await;
        drop(WsConnectionPermit::new(
            limiter,
            "ws_conn:u2".into(),
            RateLimitMode::Fallback,
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fallback.is_empty());
    }
}
