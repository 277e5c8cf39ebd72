//! Two-tier rate limiting.
//!
//! The primary tier is a distributed fixed-window counter (Redis). When the
//! primary errors or times out, the same limit is enforced by a process-local
//! [`InMemoryRateLimiter`]; requests are never let through unchecked.

mod client_ip;
mod fallback;
mod policy;
mod redis_backend;
mod ws_conn;

pub use client_ip::{principal_for, ClientIpResolver};
pub use fallback::InMemoryRateLimiter;
pub use policy::{RateLimitMiddleware, RateLimitPolicy};
pub use redis_backend::RedisRateLimitBackend;
pub use ws_conn::{WsConnectionLimit, WsConnectionPermit};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::metrics::RATE_LIMIT_BACKEND_ERRORS_TOTAL;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_MODE: &str = "x-ratelimit-mode";

const DEFAULT_PRIMARY_TIMEOUT: Duration = Duration::from_millis(250);

/// Result of counting one request against a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the window resets.
    pub reset_after: Duration,
}

impl RateLimitDecision {
    pub(crate) fn from_count(count: u64, limit: u64, reset_after: Duration) -> Self {
        Self {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_after,
        }
    }

    /// Whole seconds until reset, at least one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    #[error("rate limit backend error: {0}")]
    Backend(String),

    #[error("rate limit backend timed out after {0:?}")]
    Timeout(Duration),
}

/// Counter store port.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request against `key` and report whether it fits in `limit`
    /// for the current `window`. The window starts with the first request.
    async fn check_limit(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitError>;

    /// Give back one admission on `key` (concurrency counters).
    async fn release(&self, key: &str) -> Result<(), RateLimitError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitMode {
    Primary,
    Fallback,
}

impl RateLimitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitMode::Primary => "primary",
            RateLimitMode::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub decision: RateLimitDecision,
    pub mode: RateLimitMode,
}

/// Primary backend with a fail-closed in-memory fallback.
pub struct RateLimiter {
    primary: Option<Arc<dyn RateLimiterBackend>>,
    fallback: Arc<InMemoryRateLimiter>,
    primary_timeout: Duration,
}

impl RateLimiter {
    pub fn new(primary: Arc<dyn RateLimiterBackend>, fallback: Arc<InMemoryRateLimiter>) -> Self {
        Self {
            primary: Some(primary),
            fallback,
            primary_timeout: DEFAULT_PRIMARY_TIMEOUT,
        }
    }

    /// Limiter without a distributed tier; every decision is local.
    pub fn local(fallback: Arc<InMemoryRateLimiter>) -> Self {
        Self {
            primary: None,
            fallback,
            primary_timeout: DEFAULT_PRIMARY_TIMEOUT,
        }
    }

    pub fn with_primary_timeout(mut self, primary_timeout: Duration) -> Self {
        self.primary_timeout = primary_timeout;
        self
    }

    pub async fn check(&self, key: &str, limit: u64, window: Duration) -> RateLimitOutcome {
        if let Some(primary) = &self.primary {
            let result = timeout(self.primary_timeout, primary.check_limit(key, limit, window))
                .await
                .unwrap_or(Err(RateLimitError::Timeout(self.primary_timeout)));

            match result {
                Ok(decision) => {
                    return RateLimitOutcome {
                        decision,
                        mode: RateLimitMode::Primary,
                    }
                }
                Err(e) => {
                    RATE_LIMIT_BACKEND_ERRORS_TOTAL.inc();
                    tracing::warn!(key = %key, error = %e, "Rate limit backend unavailable, using in-memory fallback");
                }
            }
        }

        RateLimitOutcome {
            decision: self.fallback.check(key, limit, window),
            mode: RateLimitMode::Fallback,
        }
    }

    /// Release one admission on the tier that granted it.
    pub async fn release(&self, key: &str, mode: RateLimitMode) {
        match (mode, &self.primary) {
            (RateLimitMode::Primary, Some(primary)) => {
                let result = timeout(self.primary_timeout, primary.release(key))
                    .await
                    .unwrap_or(Err(RateLimitError::Timeout(self.primary_timeout)));
                if let Err(e) = result {
                    RATE_LIMIT_BACKEND_ERRORS_TOTAL.inc();
                    tracing::warn!(key = %key, error = %e, "Failed to release rate limit slot");
                }
            }
            _ => self.fallback.release_slot(key),
        }
    }
}
