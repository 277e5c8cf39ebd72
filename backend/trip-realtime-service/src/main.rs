use actix_middleware::{
    build_cors, CorsSettings, ErrorEnvelope, InMemoryRateLimiter, Logging, MetricsMiddleware,
    RequestId, SecurityHeaders,
};
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use jwt_security::{JwksCache, JwtValidator, TokenValidator};
use redis_utils::RedisPool;
use std::sync::Arc;
use std::time::Duration;
use trip_realtime_service::{
    config::Config,
    error::StartupError,
    events::spawn_trip_event_listener,
    logging, routes,
    state::AppState,
    store::{InMemoryTripStore, PgTripStore, TripStore},
};

const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn build_validator(cfg: &Config) -> Result<Arc<dyn TokenValidator>, StartupError> {
    let jwks = match (cfg.auth.jwks_url(), cfg.auth.anon_key.as_deref()) {
        (Some(url), Some(anon_key)) => {
            let cache = JwksCache::with_ttl(url.as_str(), anon_key, cfg.auth.jwks_cache_ttl)
                .map_err(|e| StartupError::StartServer(format!("jwks: {e}")))?;
            tracing::info!(jwks_url = %url, "JWKS validation enabled");
            Some(Arc::new(cache))
        }
        (Some(_), None) => {
            tracing::warn!("SUPABASE_URL set without SUPABASE_ANON_KEY; JWKS validation disabled");
            None
        }
        _ => None,
    };
    if cfg.auth.jwt_secret.is_some() {
        tracing::info!("Static-secret validation enabled");
    }
    Ok(Arc::new(JwtValidator::new(cfg.auth.jwt_secret.as_deref(), jwks)))
}

async fn build_store(cfg: &Config) -> Result<Arc<dyn TripStore>, StartupError> {
    match cfg.database_url.as_deref() {
        Some(url) => {
            let store = PgTripStore::connect(url)
                .await
                .map_err(|e| StartupError::StartServer(format!("db: {e}")))?;
            Ok(Arc::new(store))
        }
        None if cfg.environment.is_production() => Err(StartupError::StartServer(
            "DATABASE_URL is required in production".into(),
        )),
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory trip store");
            Ok(Arc::new(InMemoryTripStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cfg = Config::from_env()?;

    let validator = build_validator(&cfg)?;
    let store = build_store(&cfg).await?;

    let state = match RedisPool::connect(&cfg.redis_url).await {
        Ok(redis) => {
            let fallback = Arc::new(InMemoryRateLimiter::new());
            let _sweeper = fallback.spawn_sweeper(RATE_LIMIT_SWEEP_INTERVAL);
            let state = AppState::distributed(cfg, validator, store, redis.clone(), fallback)
                .map_err(|e| StartupError::StartServer(format!("metrics: {e}")))?;
            let _listener = spawn_trip_event_listener(redis.client().clone(), state.registry.clone());
            state
        }
        Err(e) if cfg.environment.is_production() => {
            return Err(StartupError::StartServer(format!("redis: {e}")).into());
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable; running single-instance");
            AppState::local(cfg, validator)
                .map_err(|e| StartupError::StartServer(format!("metrics: {e}")))?
                .with_store(store)
        }
    };

    let bind_addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!(
        %bind_addr,
        environment = state.config.environment.as_str(),
        distributed = state.redis.is_some(),
        "starting trip-realtime-service"
    );

    let cors = CorsSettings::new(
        state.config.frontend_url.clone(),
        state.config.allowed_origins.clone(),
    );
    let debug = state.config.debug_errors();
    let hsts = state.config.environment.is_production();
    let app_state = state.clone();

    let server = HttpServer::new(move || {
        App::new()
            .wrap(MetricsMiddleware)
            .wrap(Logging)
            .wrap(build_cors(&cors))
            .wrap(SecurityHeaders::new(hsts))
            .wrap(ErrorEnvelope::new(debug))
            .wrap(RequestId::new())
            .app_data(web::JsonConfig::default().limit(64 * 1024))
            .configure(|cfg| routes::configure(cfg, &app_state))
    })
    .bind(&bind_addr)
    .map_err(|e| StartupError::StartServer(format!("bind: {e}")))?
    .run();

    let result = server.await;

    tracing::info!("closing WebSocket sessions");
    state.registry.close_all().await;
    result.context("HTTP server terminated")
}
