//! Remote JSON Web Key Set cache.
//!
//! Keys are fetched lazily on lookup. Refreshes are serialized by a dedicated
//! mutex so a burst of lookups against a stale cache issues one HTTP request;
//! a successful refresh swaps the whole `kid -> key` map at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::JwksError;

pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(15 * 60);
const JWKS_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const JWKS_PATH: &str = "/auth/v1/.well-known/jwks.json";

/// JWKS endpoint for an identity provider base URL.
pub fn jwks_url_for(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), JWKS_PATH)
}

/// Key type of a JWK, used to refuse verifying with an algorithm of the wrong family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Hmac,
    Rsa,
    Other,
}

impl KeyFamily {
    pub fn supports(self, alg: Algorithm) -> bool {
        matches!(
            (self, alg),
            (KeyFamily::Hmac, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
                | (KeyFamily::Rsa, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512)
        )
    }
}

/// A verification key resolved from the key set.
#[derive(Clone)]
pub struct JwksKey {
    pub kid: String,
    /// Algorithm declared by the key itself, if any.
    pub algorithm: Option<Algorithm>,
    pub family: KeyFamily,
    pub decoding_key: DecodingKey,
}

impl std::fmt::Debug for JwksKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

type KeyMap = Arc<HashMap<String, Arc<JwksKey>>>;

struct CacheState {
    keys: KeyMap,
    expires_at: Option<Instant>,
    /// Bumped on every successful refresh.
    generation: u64,
}

impl CacheState {
    fn is_fresh(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() < at)
    }
}

#[derive(Deserialize)]
struct RawJwkSet {
    #[serde(default)]
    keys: Vec<serde_json::Value>,
}

/// Process-wide JWKS cache. Construct once and share through an `Arc`.
pub struct JwksCache {
    client: reqwest::Client,
    url: String,
    api_key: String,
    ttl: Duration,
    state: RwLock<CacheState>,
    refresh_lock: Mutex<()>,
}

impl JwksCache {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, JwksError> {
        Self::with_ttl(url, api_key, DEFAULT_JWKS_TTL)
    }

    pub fn with_ttl(
        url: impl Into<String>,
        api_key: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, JwksError> {
        let client = reqwest::Client::builder()
            .timeout(JWKS_HTTP_TIMEOUT)
            .build()
            .map_err(|e| JwksError::Misconfigured(format!("http client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            ttl,
            state: RwLock::new(CacheState {
                keys: Arc::new(HashMap::new()),
                expires_at: None,
                generation: 0,
            }),
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolve the verification key for `kid`, refreshing on miss or expiry.
    pub async fn get_key(&self, kid: &str) -> Result<Arc<JwksKey>, JwksError> {
        if self.url.is_empty() {
            return Err(JwksError::Misconfigured("JWKS URL is empty".into()));
        }
        if self.api_key.is_empty() {
            return Err(JwksError::Misconfigured("JWKS api key is empty".into()));
        }

        let seen_generation = {
            let state = self.state.read().await;
            if state.is_fresh() {
                if let Some(key) = state.keys.get(kid) {
                    return Ok(Arc::clone(key));
                }
            }
            state.generation
        };

        let _refresh = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        {
            let state = self.state.read().await;
            if state.generation != seen_generation && state.is_fresh() {
                return state
                    .keys
                    .get(kid)
                    .cloned()
                    .ok_or_else(|| JwksError::KeyNotFound(kid.to_string()));
            }
            if state.is_fresh() {
                if let Some(key) = state.keys.get(kid) {
                    return Ok(Arc::clone(key));
                }
            }
        }

        let keys = self.refresh(kid).await?;
        keys.get(kid)
            .cloned()
            .ok_or_else(|| JwksError::KeyNotFound(kid.to_string()))
    }

    /// Fetch the key set and publish it. The previous map survives any failure.
    async fn refresh(&self, target_kid: &str) -> Result<KeyMap, JwksError> {
        info!(url = %self.url, kid = %target_kid, "Refreshing JWKS");

        let response = self
            .client
            .get(&self.url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| JwksError::Upstream(format!("request failed: {e}")))?
            .error_for_status()
            .map_err(|e| JwksError::Upstream(format!("bad status: {e}")))?;

        let set: RawJwkSet = response
            .json()
            .await
            .map_err(|e| JwksError::Upstream(format!("invalid JWKS body: {e}")))?;

        let mut keys = HashMap::with_capacity(set.keys.len());
        for raw in set.keys {
            match parse_key(raw) {
                Some(key) => {
                    keys.insert(key.kid.clone(), Arc::new(key));
                }
                None => debug!("Skipping unusable JWK entry"),
            }
        }

        let keys: KeyMap = Arc::new(keys);
        let mut state = self.state.write().await;
        state.keys = Arc::clone(&keys);
        state.expires_at = Some(Instant::now() + self.ttl);
        state.generation += 1;

        info!(key_count = keys.len(), "JWKS refreshed");
        Ok(keys)
    }
}

fn parse_key(raw: serde_json::Value) -> Option<JwksKey> {
    let jwk: Jwk = match serde_json::from_value(raw) {
        Ok(jwk) => jwk,
        Err(e) => {
            warn!(error = %e, "Failed to parse JWK");
            return None;
        }
    };

    let kid = jwk.common.key_id.clone().filter(|k| !k.is_empty())?;
    let decoding_key = match DecodingKey::from_jwk(&jwk) {
        Ok(key) => key,
        Err(e) => {
            warn!(kid = %kid, error = %e, "Failed to build decoding key from JWK");
            return None;
        }
    };

    let family = match jwk.algorithm {
        AlgorithmParameters::RSA(_) => KeyFamily::Rsa,
        AlgorithmParameters::OctetKey(_) => KeyFamily::Hmac,
        _ => KeyFamily::Other,
    };

    Some(JwksKey {
        kid,
        algorithm: jwk.common.key_algorithm.and_then(signature_algorithm),
        family,
        decoding_key,
    })
}

/// Signature algorithm for a JWK `alg`; encryption algorithms have none.
fn signature_algorithm(alg: KeyAlgorithm) -> Option<Algorithm> {
    match alg {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}
