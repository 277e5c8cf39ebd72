//! Authentication gate.
//!
//! Extracts a bearer token from, in order:
//! 1. `Authorization: Bearer <token>`
//! 2. the `token` query parameter
//! 3. `Sec-WebSocket-Protocol`, for WebSocket upgrade requests only
//!
//! A verified token attaches an [`AuthenticatedUser`] to the request context.
//! When the client offered subprotocols, a `101 Switching Protocols` response
//! is given a `Sec-WebSocket-Protocol` echo so browsers accept the handshake.

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{self, HeaderValue},
    http::StatusCode,
    web, Error,
};
use error_types::{error_codes, AppError};
use futures::future::{ready, Ready};
use jwt_security::{JwtError, TokenValidator};
use serde::Deserialize;
use serde_json::Map;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use tracing::Instrument;

use crate::context::{AuthenticatedUser, RequestContext};

/// Fixed token accepted by the development simulator bypass.
pub const SIMULATOR_TOKEN: &str = "simulator-dev-token-bypass";
pub const SIMULATOR_USER_ID: &str = "00000000-0000-0000-0000-000000000001";

/// Subprotocol entries announcing that the next entry is the token.
const PROTOCOL_SENTINELS: [&str; 2] = ["bearer", "access_token"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Header,
    Query,
    Subprotocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedToken {
    pub token: String,
    pub source: TokenSource,
    /// Subprotocol to echo on a successful upgrade.
    pub echo_protocol: Option<String>,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn is_websocket_upgrade(req: &ServiceRequest) -> bool {
    let upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    upgrade || req.headers().contains_key(header::SEC_WEBSOCKET_KEY)
}

fn looks_like_jwt(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty())
}

fn offered_protocols(req: &ServiceRequest) -> Vec<String> {
    req.headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Token carried in the subprotocol list, with the entry to echo back.
fn token_from_protocols(protocols: &[String]) -> Option<(String, String)> {
    if let Some(pos) = protocols
        .iter()
        .position(|p| PROTOCOL_SENTINELS.iter().any(|s| p.eq_ignore_ascii_case(s)))
    {
        if let Some(token) = protocols.get(pos + 1) {
            return Some((token.clone(), protocols[pos].clone()));
        }
    }
    protocols
        .iter()
        .find(|p| looks_like_jwt(p))
        .map(|token| (token.clone(), token.clone()))
}

/// Locate the credential on `req`.
pub fn extract_token(req: &ServiceRequest) -> Result<ExtractedToken, AppError> {
    let upgrade = is_websocket_upgrade(req);
    let protocols = if upgrade {
        offered_protocols(req)
    } else {
        Vec::new()
    };
    let default_echo = protocols.first().cloned();

    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        let value = value.to_str().unwrap_or_default();
        let token = value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AppError::unauthorized(
                    error_codes::INVALID_AUTH_FORMAT,
                    "Authorization header must be 'Bearer <token>'",
                )
            })?;
        return Ok(ExtractedToken {
            token: token.to_string(),
            source: TokenSource::Header,
            echo_protocol: default_echo,
        });
    }

    if let Ok(query) = web::Query::<TokenQuery>::from_query(req.query_string()) {
        if let Some(token) = query.into_inner().token.filter(|t| !t.is_empty()) {
            return Ok(ExtractedToken {
                token,
                source: TokenSource::Query,
                echo_protocol: default_echo,
            });
        }
    }

    if upgrade {
        if let Some((token, echo)) = token_from_protocols(&protocols) {
            return Ok(ExtractedToken {
                token,
                source: TokenSource::Subprotocol,
                echo_protocol: Some(echo),
            });
        }
        return Err(AppError::unauthorized(
            error_codes::WEBSOCKET_TOKEN_MISSING,
            "WebSocket connection requires a token",
        ));
    }

    Err(AppError::unauthorized(
        error_codes::TOKEN_MISSING,
        "Authorization token required",
    ))
}

/// Client-facing error for a validation failure.
pub fn auth_error(err: &JwtError) -> AppError {
    match err {
        JwtError::TokenExpired => AppError::token_expired(),
        JwtError::TokenInvalid(_) | JwtError::TokenMissingClaim(_) => {
            AppError::unauthorized(error_codes::INVALID_TOKEN, "Invalid token")
        }
        JwtError::KeyNotFound(_) | JwtError::ValidationMethodUnavailable => {
            AppError::unauthorized(error_codes::AUTH_FAILED, "Authentication failed")
        }
    }
}

fn simulator_user() -> AuthenticatedUser {
    AuthenticatedUser {
        user_id: SIMULATOR_USER_ID.to_string(),
        email: None,
        username: Some("simulator".to_string()),
        role: None,
        is_admin: false,
        claims: Map::new(),
    }
}

/// Authentication gate middleware.
#[derive(Clone)]
pub struct AuthGate {
    validator: Arc<dyn TokenValidator>,
    simulator_bypass: bool,
}

impl AuthGate {
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            validator,
            simulator_bypass: false,
        }
    }

    /// Accept [`SIMULATOR_TOKEN`]. Only pass `true` in development.
    pub fn with_simulator_bypass(mut self, enabled: bool) -> Self {
        self.simulator_bypass = enabled;
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AuthGateService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthGateService {
            service: Rc::new(service),
            validator: self.validator.clone(),
            simulator_bypass: self.simulator_bypass,
        }))
    }
}

pub struct AuthGateService<S> {
    service: Rc<S>,
    validator: Arc<dyn TokenValidator>,
    simulator_bypass: bool,
}

impl<S, B> Service<ServiceRequest> for AuthGateService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let validator = self.validator.clone();
        let simulator_bypass = self.simulator_bypass;

        Box::pin(async move {
            let extracted = match extract_token(&req) {
                Ok(extracted) => extracted,
                Err(e) => {
                    tracing::warn!(path = %req.path(), code = e.error_code(), "Missing credentials");
                    return Ok(req.error_response(e).map_into_right_body());
                }
            };

            let user = if simulator_bypass && extracted.token == SIMULATOR_TOKEN {
                tracing::warn!(user_id = SIMULATOR_USER_ID, "Simulator token bypass used");
                simulator_user()
            } else {
                match validator.validate(&extracted.token).await {
                    Ok(claims) => AuthenticatedUser::from(claims),
                    Err(e) => {
                        tracing::warn!(
                            path = %req.path(),
                            source = ?extracted.source,
                            error = %e,
                            "Token validation failed"
                        );
                        return Ok(req.error_response(auth_error(&e)).map_into_right_body());
                    }
                }
            };

            let ctx = RequestContext::attach_user(&req, user);
            let span = tracing::info_span!(
                "authenticated",
                request_id = %ctx.request_id,
                user_id = ctx.user_id().unwrap_or_default()
            );

            let mut res = service.call(req).instrument(span).await?;

            if res.status() == StatusCode::SWITCHING_PROTOCOLS
                && !res.headers().contains_key(header::SEC_WEBSOCKET_PROTOCOL)
            {
                if let Some(value) = extracted
                    .echo_protocol
                    .as_deref()
                    .and_then(|p| HeaderValue::from_str(p).ok())
                {
                    res.headers_mut()
                        .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
            }

            Ok(res.map_into_left_body())
        })
    }
}
