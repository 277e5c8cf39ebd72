use actix_middleware::{ClientIpResolver, InMemoryRateLimiter, RateLimiter, RedisRateLimitBackend};
use event_schema::EventEmitter;
use jwt_security::TokenValidator;
use redis_utils::RedisPool;
use std::sync::Arc;

use crate::config::Config;
use crate::events::{LocalEventPublisher, RedisEventPublisher};
use crate::store::{InMemoryTripStore, TripStore};
use crate::websocket::{SessionMetrics, SessionRegistry};

/// Event source recorded on every emitted event.
pub const EVENT_SOURCE: &str = "trip-realtime-service";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn TripStore>,
    pub emitter: EventEmitter,
    pub registry: SessionRegistry,
    pub session_metrics: SessionMetrics,
    pub rate_limiter: Arc<RateLimiter>,
    pub ip_resolver: Arc<ClientIpResolver>,
    pub validator: Arc<dyn TokenValidator>,
    /// Absent when running without Redis (local development, tests).
    pub redis: Option<RedisPool>,
}

impl AppState {
    /// Single-process state: in-memory store, local event delivery and a
    /// process-local rate limiter.
    pub fn local(
        config: Config,
        validator: Arc<dyn TokenValidator>,
    ) -> Result<Self, prometheus::Error> {
        let registry = SessionRegistry::new();
        let emitter = EventEmitter::new(
            Arc::new(LocalEventPublisher::new(registry.clone())),
            EVENT_SOURCE,
        );
        Ok(Self {
            ip_resolver: Arc::new(ClientIpResolver::new(&config.trusted_proxies)),
            config: Arc::new(config),
            store: Arc::new(InMemoryTripStore::new()),
            emitter,
            registry,
            session_metrics: SessionMetrics::new()?,
            rate_limiter: Arc::new(RateLimiter::local(Arc::new(InMemoryRateLimiter::new()))),
            validator,
            redis: None,
        })
    }

    /// Multi-instance state: events travel over Redis pub/sub and the rate
    /// limiter counts in Redis with `fallback` taking over during outages.
    pub fn distributed(
        config: Config,
        validator: Arc<dyn TokenValidator>,
        store: Arc<dyn TripStore>,
        redis: RedisPool,
        fallback: Arc<InMemoryRateLimiter>,
    ) -> Result<Self, prometheus::Error> {
        let emitter = EventEmitter::new(
            Arc::new(RedisEventPublisher::new(redis.manager())),
            EVENT_SOURCE,
        );
        let primary = Arc::new(RedisRateLimitBackend::new(redis.manager()));
        Ok(Self {
            ip_resolver: Arc::new(ClientIpResolver::new(&config.trusted_proxies)),
            config: Arc::new(config),
            store,
            emitter,
            registry: SessionRegistry::new(),
            session_metrics: SessionMetrics::new()?,
            rate_limiter: Arc::new(RateLimiter::new(primary, fallback)),
            validator,
            redis: Some(redis),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn TripStore>) -> Self {
        self.store = store;
        self
    }
}
