//! Per-request context carried in the request extensions.
//!
//! `RequestContext` is the only extension the edge pipeline stores identity
//! in. Handlers read it through the `RequestContext`, `UserId` and
//! `AuthenticatedUser` extractors.

use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpMessage, HttpRequest};
use error_types::{error_codes, AppError};
use futures::future::{ready, Ready};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Authenticated principal attached by the auth gate.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub role: Option<String>,
    pub is_admin: bool,
    /// Full decoded claim set.
    pub claims: Map<String, Value>,
}

impl From<jwt_security::ValidatedClaims> for AuthenticatedUser {
    fn from(claims: jwt_security::ValidatedClaims) -> Self {
        Self {
            user_id: claims.user_id,
            email: claims.email,
            username: claims.username,
            role: claims.role,
            is_admin: claims.is_admin,
            claims: claims.raw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub user: Option<AuthenticatedUser>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user: None,
        }
    }

    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.user_id.as_str())
    }

    pub fn is_admin(&self) -> bool {
        self.user.as_ref().is_some_and(|u| u.is_admin)
    }

    /// Context of `req`, if the request-id middleware ran.
    pub fn of(req: &impl HttpMessage) -> Option<RequestContext> {
        req.extensions().get::<RequestContext>().cloned()
    }

    /// Attach `user` to the request's context, creating the context if needed.
    pub fn attach_user(req: &impl HttpMessage, user: AuthenticatedUser) -> RequestContext {
        let mut extensions = req.extensions_mut();
        match extensions.get_mut::<RequestContext>() {
            Some(ctx) => {
                ctx.user = Some(user);
                ctx.clone()
            }
            None => {
                let mut ctx = RequestContext::generate();
                ctx.user = Some(user);
                extensions.insert(ctx.clone());
                ctx
            }
        }
    }
}

/// Request ID of `req`, or an empty string outside the middleware chain.
pub fn request_id_of(req: &impl HttpMessage) -> String {
    req.extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default()
}

/// Authenticated user ID (`sub` claim), treated as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn unauthenticated() -> actix_web::Error {
    AppError::unauthorized(error_codes::UNAUTHORIZED, "User not authenticated").into()
}

impl FromRequest for RequestContext {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Ok(RequestContext::of(req).unwrap_or_else(RequestContext::generate)))
    }
}

impl FromRequest for UserId {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let user_id = req
            .extensions()
            .get::<RequestContext>()
            .and_then(|ctx| ctx.user_id().map(|id| UserId(id.to_string())));
        ready(user_id.ok_or_else(unauthenticated))
    }
}

impl FromRequest for AuthenticatedUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let user = req
            .extensions()
            .get::<RequestContext>()
            .and_then(|ctx| ctx.user.clone());
        ready(user.ok_or_else(unauthenticated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

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

    #[actix_web::test]
    async fn test_user_id_extractor() {
        let req = TestRequest::default().to_http_request();
        req.extensions_mut().insert(RequestContext::new("req-1"));
        RequestContext::attach_user(&req, user("u-1"));

        let user_id = UserId::extract(&req).await.unwrap();
        assert_eq!(user_id.as_str(), "u-1");
        assert_eq!(request_id_of(&req), "req-1");
    }

    #[actix_web::test]
    async fn test_user_id_extractor_rejects_anonymous() {
        let req = TestRequest::default().to_http_request();
        req.extensions_mut().insert(RequestContext::new("req-2"));

        let err = UserId::extract(&req).await.unwrap_err();
        assert_eq!(err.as_response_error().status_code(), 401);
    }

    #[test]
    fn test_attach_user_creates_context() {
        let req = TestRequest::default().to_http_request();
        let ctx = RequestContext::attach_user(&req, user("u-3"));
        assert_eq!(ctx.user_id(), Some("u-3"));
        assert!(!ctx.request_id.is_empty());
        assert_eq!(RequestContext::of(&req).unwrap().request_id, ctx.request_id);
    }
}
