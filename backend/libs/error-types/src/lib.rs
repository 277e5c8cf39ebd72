//! Client-facing error taxonomy and the JSON error envelope.
//!
//! Every error that leaves a service is mapped to one [`AppError`] kind and
//! rendered as:
//!
//! ```json
//! {
//!   "success": false,
//!   "error": { "code": "token_expired", "message": "...", "details": null, "traceID": "..." },
//!   "meta": { "requestID": "...", "timestamp": "...", "version": "v1" }
//! }
//! ```
//!
//! Internal causes (database messages, upstream bodies) are never sent to the
//! client unless the envelope is rendered in debug mode.

use actix_web::http::header::{HeaderValue, RETRY_AFTER};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// API version reported in `meta.version`.
pub const API_VERSION: &str = "v1";

/// Unified service error.
///
/// Handlers return `Result<_, AppError>` and rely on `?`; the error middleware
/// turns the value into the envelope with the request's ID filled in.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("validation failed: {message}")]
    Validation {
        code: &'static str,
        message: String,
        details: Option<Value>,
    },

    #[error("authentication failed: {message}")]
    Auth {
        code: &'static str,
        message: String,
        refresh_required: bool,
    },

    #[error("authorization failed: {message}")]
    Authorization { code: &'static str, message: String },

    #[error("not found: {message}")]
    NotFound { code: &'static str, message: String },

    #[error("conflict: {message}")]
    Conflict { code: &'static str, message: String },

    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimitExceeded { retry_after: u64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("external service {service} failed: {message}")]
    ExternalService { service: String, message: String },

    #[error("internal server error: {0}")]
    Server(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation {
            code: error_codes::VALIDATION_FAILED,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Validation {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Auth {
            code,
            message: message.into(),
            refresh_required: false,
        }
    }

    /// Expired credentials: the client should refresh and retry.
    pub fn token_expired() -> Self {
        AppError::Auth {
            code: error_codes::TOKEN_EXPIRED,
            message: "Token has expired".to_string(),
            refresh_required: true,
        }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Authorization {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        AppError::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AppError::Conflict {
            code: error_codes::CONFLICT,
            message: message.into(),
        }
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        AppError::RateLimitExceeded { retry_after }
    }

    pub fn database(err: impl std::fmt::Display) -> Self {
        AppError::Database(err.to_string())
    }

    pub fn external(service: impl Into<String>, err: impl std::fmt::Display) -> Self {
        AppError::ExternalService {
            service: service.into(),
            message: err.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AppError::Server(message.into())
    }

    /// Attach a detail bag to a validation error. Other kinds are returned unchanged.
    pub fn with_details(self, value: Value) -> Self {
        match self {
            AppError::Validation { code, message, .. } => AppError::Validation {
                code,
                message,
                details: Some(value),
            },
            other => other,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation { .. } => 400,
            AppError::Auth { .. } => 401,
            AppError::Authorization { .. } => 403,
            AppError::NotFound { .. } => 404,
            AppError::Conflict { .. } => 409,
            AppError::RateLimitExceeded { .. } => 429,
            AppError::Database(_) | AppError::ExternalService { .. } | AppError::Server(_) => 500,
        }
    }

    /// Machine-readable code sent as `error.code`.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Authorization { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Conflict { code, .. } => code,
            AppError::RateLimitExceeded { .. } => error_codes::RATE_LIMIT_EXCEEDED,
            AppError::Database(_) => error_codes::DATABASE_ERROR,
            AppError::ExternalService { .. } => error_codes::EXTERNAL_SERVICE_ERROR,
            AppError::Server(_) => error_codes::INTERNAL_ERROR,
        }
    }

    /// Error kind label, used in logs and metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => error_types::VALIDATION_ERROR,
            AppError::Auth { .. } => error_types::AUTHENTICATION_ERROR,
            AppError::Authorization { .. } => error_types::AUTHORIZATION_ERROR,
            AppError::NotFound { .. } => error_types::NOT_FOUND_ERROR,
            AppError::Conflict { .. } => error_types::CONFLICT_ERROR,
            AppError::RateLimitExceeded { .. } => error_types::RATE_LIMIT_ERROR,
            AppError::Database(_) => error_types::DATABASE_ERROR,
            AppError::ExternalService { .. } => error_types::EXTERNAL_SERVICE_ERROR,
            AppError::Server(_) => error_types::SERVER_ERROR,
        }
    }

    /// Message safe to show to clients. Server-side kinds get a generic text.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Validation { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Authorization { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Conflict { message, .. } => message.clone(),
            AppError::RateLimitExceeded { .. } => {
                "Too many requests, please retry later".to_string()
            }
            AppError::Database(_) => "A database error occurred".to_string(),
            AppError::ExternalService { .. } => "An upstream service failed".to_string(),
            AppError::Server(_) => "An internal error occurred".to_string(),
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// Render the envelope.
    ///
    /// `debug` exposes the internal cause of server-side errors in `details`.
    pub fn to_response(&self, request_id: &str, debug: bool) -> ErrorResponse {
        let mut response = ErrorResponse::new(self.error_code(), self.client_message())
            .with_request_id(request_id);

        match self {
            AppError::Validation {
                details: Some(details),
                ..
            } => {
                response = response.with_details(details.clone());
            }
            AppError::Auth {
                refresh_required: true,
                ..
            } => {
                response.error.refresh_required = true;
            }
            AppError::RateLimitExceeded { retry_after } => {
                response.error.retry_after = Some(*retry_after);
            }
            _ => {}
        }

        if debug && self.is_server_error() {
            response = response.with_details(Value::String(self.to_string()));
        }

        response
    }

    /// Build the HTTP response for this error.
    pub fn render(&self, request_id: &str, debug: bool) -> HttpResponse {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut builder = HttpResponse::build(status);
        if let AppError::RateLimitExceeded { retry_after } = self {
            builder.insert_header((RETRY_AFTER, HeaderValue::from(*retry_after)));
        }
        builder.json(self.to_response(request_id, debug))
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        // The request ID is filled in by the error envelope middleware.
        self.render("", false)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation {
            code: error_codes::INVALID_PAYLOAD,
            message: format!("Invalid JSON payload: {err}"),
            details: None,
        }
    }
}

/// Error envelope (all services).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `false` for errors.
    pub success: bool,
    pub error: ErrorBody,
    pub meta: ResponseMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,

    /// Only populated for validation details or in debug mode.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<Value>,

    #[serde(rename = "traceID")]
    pub trace_id: String,

    /// Set on `token_expired` so clients know to refresh.
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub refresh_required: bool,

    /// Seconds until the rate-limit window resets.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub timestamp: String,
    pub version: String,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
                details: None,
                trace_id: String::new(),
                refresh_required: false,
                retry_after: None,
            },
            meta: ResponseMeta {
                request_id: String::new(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                version: API_VERSION.to_string(),
            },
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error.details = Some(details);
        self
    }

    /// Sets `meta.requestID`; the trace ID follows it unless set explicitly.
    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.meta.request_id = request_id.to_string();
        if self.error.trace_id.is_empty() {
            self.error.trace_id = request_id.to_string();
        }
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.error.trace_id = trace_id.into();
        self
    }
}

/// Machine-readable error codes.
pub mod error_codes {
    // Authentication
    pub const TOKEN_EXPIRED: &str = "token_expired";
    pub const INVALID_TOKEN: &str = "invalid_token";
    pub const TOKEN_MISSING: &str = "token_missing";
    pub const WEBSOCKET_TOKEN_MISSING: &str = "websocket_token_missing";
    pub const INVALID_AUTH_FORMAT: &str = "invalid_auth_format";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const UNAUTHORIZED: &str = "unauthorized";

    // Authorization
    pub const NOT_TRIP_MEMBER: &str = "not_trip_member";
    pub const INSUFFICIENT_PERMISSIONS: &str = "insufficient_permissions";
    pub const OWNER_IMMUTABLE: &str = "owner_immutable";

    // Request shape
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const MISSING_TRIP_ID: &str = "missing_trip_id";
    pub const INVALID_ROLE: &str = "invalid_role";
    pub const WEBSOCKET_UPGRADE_FAILED: &str = "websocket_upgrade_failed";

    // Resources
    pub const TRIP_NOT_FOUND: &str = "trip_not_found";
    pub const MEMBER_NOT_FOUND: &str = "member_not_found";
    pub const INVITATION_NOT_FOUND: &str = "invitation_not_found";
    pub const USER_NOT_FOUND: &str = "user_not_found";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";

    // Throttling
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const TOO_MANY_CONNECTIONS: &str = "too_many_connections";

    // Server side
    pub const DATABASE_ERROR: &str = "database_error";
    pub const EXTERNAL_SERVICE_ERROR: &str = "external_service_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Error kind labels.
pub mod error_types {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const AUTHENTICATION_ERROR: &str = "authentication_error";
    pub const AUTHORIZATION_ERROR: &str = "authorization_error";
    pub const NOT_FOUND_ERROR: &str = "not_found_error";
    pub const CONFLICT_ERROR: &str = "conflict_error";
    pub const RATE_LIMIT_ERROR: &str = "rate_limit_error";
    pub const DATABASE_ERROR: &str = "database_error";
    pub const EXTERNAL_SERVICE_ERROR: &str = "external_service_error";
    pub const SERVER_ERROR: &str = "server_error";
}
