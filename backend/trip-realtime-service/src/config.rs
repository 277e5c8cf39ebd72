use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::websocket::SessionConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::Invalid {
                name: "SERVER_ENVIRONMENT",
                reason: format!("unknown environment {other:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub supabase_url: Option<String>,
    pub anon_key: Option<String>,
    pub jwt_secret: Option<String>,
    pub jwks_cache_ttl: Duration,
    /// Requested simulator bypass; only honoured in development.
    pub simulator_bypass: bool,
}

impl AuthConfig {
    pub fn jwks_url(&self) -> Option<String> {
        self.supabase_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .map(jwt_security::jwks_url_for)
    }

    pub fn has_validation_method(&self) -> bool {
        self.jwks_url().is_some() || self.jwt_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    pub auth_requests_per_minute: u64,
    pub auth_window: Duration,
    pub ws_max_connections_per_user: u64,
    pub ws_connection_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            auth_requests_per_minute: 10,
            auth_window: Duration::from_secs(60),
            ws_max_connections_per_user: 10,
            ws_connection_window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub port: u16,
    pub frontend_url: Option<String>,
    pub allowed_origins: Vec<String>,
    pub trusted_proxies: Vec<String>,
    pub redis_url: String,
    pub database_url: Option<String>,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub websocket: SessionConfig,
    /// Carried for collaborators outside this service.
    pub pexels_api_key: Option<String>,
    pub geoapify_key: Option<String>,
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn seconds_or(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Development defaults with no identity provider configured.
impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            port: 8080,
            frontend_url: None,
            allowed_origins: Vec::new(),
            trusted_proxies: Vec::new(),
            redis_url: "redis://127.0.0.1:6379".into(),
            database_url: None,
            auth: AuthConfig {
                supabase_url: None,
                anon_key: None,
                jwt_secret: None,
                jwks_cache_ttl: jwt_security::DEFAULT_JWKS_TTL,
                simulator_bypass: false,
            },
            rate_limit: RateLimitConfig::default(),
            websocket: SessionConfig::default(),
            pexels_api_key: None,
            geoapify_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let environment = match optional("SERVER_ENVIRONMENT") {
            Some(value) => value.parse()?,
            None => Environment::Development,
        };

        let auth = AuthConfig {
            supabase_url: optional("SUPABASE_URL"),
            anon_key: optional("SUPABASE_ANON_KEY"),
            jwt_secret: optional("SUPABASE_JWT_SECRET"),
            jwks_cache_ttl: seconds_or("JWKS_CACHE_TTL_SECONDS", jwt_security::DEFAULT_JWKS_TTL),
            simulator_bypass: flag("SIMULATOR_BYPASS"),
        };

        let defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            requests_per_minute: parsed_or(
                "RATE_LIMIT_REQUESTS_PER_MINUTE",
                defaults.requests_per_minute,
            ),
            requests_per_hour: parsed_or("RATE_LIMIT_REQUESTS_PER_HOUR", defaults.requests_per_hour),
            auth_requests_per_minute: parsed_or(
                "RATE_LIMIT_AUTH_REQUESTS_PER_MINUTE",
                defaults.auth_requests_per_minute,
            ),
            auth_window: seconds_or("RATE_LIMIT_WINDOW_SECONDS", defaults.auth_window),
            ws_max_connections_per_user: parsed_or(
                "WS_MAX_CONNECTIONS_PER_USER",
                defaults.ws_max_connections_per_user,
            ),
            ws_connection_window: seconds_or(
                "WS_CONNECTION_WINDOW_SECONDS",
                defaults.ws_connection_window,
            ),
        };

        let ws = SessionConfig::default();
        let websocket = SessionConfig {
            write_wait: seconds_or("WS_WRITE_WAIT_SECONDS", ws.write_wait),
            pong_wait: seconds_or("WS_PONG_WAIT_SECONDS", ws.pong_wait),
            ping_period: seconds_or("WS_PING_PERIOD_SECONDS", ws.ping_period),
            max_message_size: parsed_or("WS_MAX_MESSAGE_SIZE", ws.max_message_size),
            buffer_size: parsed_or("WS_BUFFER_SIZE", ws.buffer_size),
            buffer_high_water: parsed_or("WS_BUFFER_HIGH_WATER", ws.buffer_high_water),
            buffer_low_water: parsed_or("WS_BUFFER_LOW_WATER", ws.buffer_low_water),
            monitor_interval: ws.monitor_interval,
        };

        let port = match env::var("PORT") {
            Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                reason: format!("{value:?} is not a port number"),
            })?,
            Err(_) => 8080,
        };

        let config = Config {
            environment,
            port,
            frontend_url: optional("FRONTEND_URL"),
            allowed_origins: optional("ALLOWED_ORIGINS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            trusted_proxies: optional("TRUSTED_PROXIES")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            redis_url: optional("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            database_url: optional("DATABASE_URL"),
            auth,
            rate_limit,
            websocket,
            pexels_api_key: optional("PEXELS_API_KEY"),
            geoapify_key: optional("GEOAPIFY_KEY"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.websocket.validate()?;

        if self.environment.is_production() && !self.auth.has_validation_method() {
            return Err(ConfigError::Missing(
                "SUPABASE_URL or SUPABASE_JWT_SECRET in production",
            ));
        }
        if self.rate_limit.ws_max_connections_per_user == 0 {
            return Err(ConfigError::Invalid {
                name: "WS_MAX_CONNECTIONS_PER_USER",
                reason: "must be at least 1".into(),
            });
        }
        if self.allowed_origins.iter().any(|o| o == "*") {
            warn!("ALLOWED_ORIGINS contains '*': any origin accepted, credentials disabled");
        }
        if self.auth.simulator_bypass && !self.environment.is_development() {
            warn!(
                environment = self.environment.as_str(),
                "SIMULATOR_BYPASS ignored outside development"
            );
        }
        Ok(())
    }

    /// Simulator bypass is honoured only in development.
    pub fn simulator_bypass_enabled(&self) -> bool {
        self.environment.is_development() && self.auth.simulator_bypass
    }

    /// Error details are rendered to clients only in development.
    pub fn debug_errors(&self) -> bool {
        self.environment.is_development()
    }
}
