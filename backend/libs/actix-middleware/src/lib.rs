//! # Actix Middleware Library
//!
//! Edge pipeline shared by the NomadCrew realtime services.
//!
//! ## Modules
//! - `context`: request context, identity extractors
//! - `request_id`: request ID assignment and echo
//! - `error_handler`: central error envelope rendering
//! - `jwt_auth`: credential extraction and the auth gate
//! - `rate_limit`: Redis-backed rate limiting with an in-memory fallback
//! - `security_headers`, `cors`: response hardening and browser origin policy
//! - `logging`, `metrics`: request logs and Prometheus metrics
//!
//! Recommended order, outermost first: `RequestId`, `ErrorEnvelope`,
//! `Logging`, `MetricsMiddleware`, `SecurityHeaders`, CORS, then per-scope
//! `AuthGate` and rate limits. actix applies the last `wrap` outermost.

pub mod context;
pub mod cors;
pub mod error_handler;
pub mod jwt_auth;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod request_id;
pub mod security_headers;

pub use context::{request_id_of, AuthenticatedUser, RequestContext, UserId};
pub use cors::{build_cors, CorsSettings};
pub use error_handler::ErrorEnvelope;
pub use jwt_auth::AuthGate;
pub use logging::Logging;
pub use metrics::{render_metrics, MetricsMiddleware};
pub use rate_limit::{
    ClientIpResolver, InMemoryRateLimiter, RateLimitMiddleware, RateLimitPolicy, RateLimiter,
    RedisRateLimitBackend, WsConnectionLimit, WsConnectionPermit,
};
pub use request_id::{RequestId, REQUEST_ID_HEADER};
pub use security_headers::SecurityHeaders;
