//! CORS policy for browser clients.
//!
//! Exact origins and `*.domain` suffix wildcards are matched. A bare `*`
//! admits any origin but turns credentials off, since browsers reject a
//! wildcard origin on credentialed responses.

use actix_cors::Cors;
use actix_web::http::{header, Method};

use crate::rate_limit::{HEADER_LIMIT, HEADER_MODE, HEADER_REMAINING, HEADER_RESET};
use crate::request_id::REQUEST_ID_HEADER;

const MAX_AGE_SECS: usize = 12 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorsSettings {
    pub frontend_url: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl CorsSettings {
    pub fn new(frontend_url: Option<String>, allowed_origins: Vec<String>) -> Self {
        Self {
            frontend_url,
            allowed_origins,
        }
    }

    pub fn allows_any(&self) -> bool {
        self.allowed_origins.iter().any(|o| o.trim() == "*")
    }

    pub fn allows_credentials(&self) -> bool {
        !self.allows_any()
    }

    fn patterns(&self) -> Vec<String> {
        self.frontend_url
            .iter()
            .chain(self.allowed_origins.iter())
            .map(|o| o.trim().trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty() && o != "*")
            .collect()
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        if self.allows_any() {
            return true;
        }
        self.patterns()
            .iter()
            .any(|pattern| origin_matches(pattern, origin))
    }
}

/// `pattern` is an exact origin or `*.example.com` / `https://*.example.com`.
fn origin_matches(pattern: &str, origin: &str) -> bool {
    let Some(wildcard) = pattern.find("*.") else {
        return pattern == origin;
    };

    let scheme = &pattern[..wildcard];
    let suffix = &pattern[wildcard + 1..];
    if !scheme.is_empty() && !origin.starts_with(scheme) {
        return false;
    }

    let host = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let host = host.split(':').next().unwrap_or(host);
    let bare = &suffix[1..];
    (host.len() > suffix.len() && host.ends_with(suffix)) || host == bare
}

pub fn build_cors(settings: &CorsSettings) -> Cors {
    let mut cors = if settings.allows_any() {
        Cors::default().allow_any_origin()
    } else {
        let matcher = settings.clone();
        Cors::default().allowed_origin_fn(move |origin, _req| {
            origin
                .to_str()
                .map(|origin| matcher.is_allowed(origin))
                .unwrap_or(false)
        })
    };

    cors = cors
        .allowed_methods(vec![
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allowed_headers(vec![
            header::ORIGIN,
            header::CONTENT_LENGTH,
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-requested-with"),
            header::ACCEPT,
            header::HeaderName::from_static("x-csrf-token"),
            header::HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers(vec![
            header::CONTENT_LENGTH,
            header::HeaderName::from_static(REQUEST_ID_HEADER),
            header::HeaderName::from_static(HEADER_LIMIT),
            header::HeaderName::from_static(HEADER_REMAINING),
            header::HeaderName::from_static(HEADER_RESET),
            header::HeaderName::from_static(HEADER_MODE),
        ])
        .max_age(MAX_AGE_SECS);

    if settings.allows_credentials() {
        cors = cors.supports_credentials();
    } else {
        tracing::warn!("CORS allows any origin, credentials disabled");
    }

    cors
}
