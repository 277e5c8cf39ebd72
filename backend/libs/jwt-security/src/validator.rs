//! Multi-mode JWT validation.
//!
//! A token is accepted when it verifies against either the static HMAC secret
//! or a key from the remote JWKS. Failures of the individual attempts are
//! combined by priority: expired, then unknown key, then invalid, then
//! "no method applied".

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{crypto, decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{JwksError, JwtError};
use crate::jwks::JwksCache;

/// Clock skew tolerated on `exp` / `nbf`.
pub const DEFAULT_VALIDATION_LEEWAY: u64 = 30;

/// The only header algorithms accepted.
pub const ALLOWED_ALGORITHMS: [Algorithm; 6] = [
    Algorithm::HS256,
    Algorithm::HS384,
    Algorithm::HS512,
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
];

fn is_hmac(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedClaims {
    pub user_id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    /// Application `role` claim.
    pub role: Option<String>,
    /// `app_metadata.role == "admin"`.
    pub is_admin: bool,
    /// Full decoded claim set.
    pub raw: Map<String, Value>,
}

impl ValidatedClaims {
    fn from_claims(raw: Map<String, Value>) -> Result<Self, JwtError> {
        let user_id = raw
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(JwtError::TokenMissingClaim("sub"))?
            .to_string();

        let user_metadata = raw.get("user_metadata");
        let metadata_str = |field: &str| {
            user_metadata
                .and_then(|m| m.get(field))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let claim_str = |field: &str| {
            raw.get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let email = claim_str("email").or_else(|| metadata_str("email"));
        let username = claim_str("username").or_else(|| metadata_str("username"));
        let role = claim_str("role");
        let is_admin = raw
            .get("app_metadata")
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
            == Some("admin");

        Ok(Self {
            user_id,
            email,
            username,
            role,
            is_admin,
            raw,
        })
    }
}

/// Token validation port used by the auth gate.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<ValidatedClaims, JwtError>;
}

pub struct JwtValidator {
    /// Decoding candidates of the static secret, in trial order.
    secrets: Vec<Vec<u8>>,
    jwks: Option<Arc<JwksCache>>,
}

impl JwtValidator {
    pub fn new(static_secret: Option<&str>, jwks: Option<Arc<JwksCache>>) -> Self {
        let secrets = static_secret
            .filter(|s| !s.is_empty())
            .map(secret_candidates)
            .unwrap_or_default();

        Self { secrets, jwks }
    }

    /// Whether at least one validation method is configured.
    pub fn has_method(&self) -> bool {
        !self.secrets.is_empty() || self.jwks.is_some()
    }

    async fn validate_with_jwks(
        &self,
        cache: &JwksCache,
        kid: &str,
        header: &Header,
        message: &str,
        signature: &str,
        token: &str,
    ) -> Result<ValidatedClaims, JwtError> {
        let key = match cache.get_key(kid).await {
            Ok(key) => key,
            Err(JwksError::KeyNotFound(kid)) => return Err(JwtError::KeyNotFound(kid)),
            Err(e) => {
                warn!(kid = %kid, error = %e, "JWKS unavailable for token validation");
                return Err(JwtError::TokenInvalid(format!("jwks unavailable: {e}")));
            }
        };

        let alg = key.algorithm.unwrap_or(header.alg);
        if alg != header.alg {
            warn!(
                kid = %kid,
                header_alg = ?header.alg,
                key_alg = ?alg,
                "Token alg header does not match JWK algorithm"
            );
        }
        if !ALLOWED_ALGORITHMS.contains(&alg) || !key.family.supports(alg) {
            return Err(JwtError::TokenInvalid(format!(
                "key {kid} cannot verify {alg:?}"
            )));
        }

        match crypto::verify(signature, message.as_bytes(), &key.decoding_key, alg) {
            Ok(true) => accept(token, alg),
            Ok(false) => Err(JwtError::TokenInvalid("signature mismatch".into())),
            Err(e) => Err(JwtError::TokenInvalid(e.to_string())),
        }
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<ValidatedClaims, JwtError> {
        let header =
            decode_header(token).map_err(|e| JwtError::TokenInvalid(format!("header: {e}")))?;

        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(JwtError::TokenInvalid(format!(
                "algorithm {:?} not allowed",
                header.alg
            )));
        }

        let (message, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| JwtError::TokenInvalid("malformed token".into()))?;

        let mut failure: Option<JwtError> = None;
        let mut record = |err: JwtError| {
            if failure.as_ref().map_or(true, |cur| err.priority() > cur.priority()) {
                failure = Some(err);
            }
        };

        if !self.secrets.is_empty() {
            if is_hmac(header.alg) {
                for secret in &self.secrets {
                    let key = DecodingKey::from_secret(secret);
                    match crypto::verify(signature, message.as_bytes(), &key, header.alg) {
                        // A verified token is final: expired or missing `sub` included.
                        Ok(true) => return accept(token, header.alg),
                        Ok(false) => continue,
                        Err(e) => debug!(error = %e, "HMAC verification error"),
                    }
                }
                record(JwtError::TokenInvalid("HMAC signature mismatch".into()));
            } else {
                record(JwtError::TokenInvalid("not an HMAC-signed token".into()));
            }
        }

        if let Some(cache) = &self.jwks {
            match header.kid.as_deref() {
                Some(kid) if !kid.is_empty() => {
                    match self
                        .validate_with_jwks(cache, kid, &header, message, signature, token)
                        .await
                    {
                        Ok(claims) => return Ok(claims),
                        Err(e) => {
                            debug!(kid = %kid, error = %e, "JWKS validation failed");
                            record(e);
                        }
                    }
                }
                _ => record(JwtError::TokenInvalid("token has no kid for JWKS".into())),
            }
        }

        Err(failure.unwrap_or(JwtError::ValidationMethodUnavailable))
    }
}

/// Decode the claims of a token whose signature has already been verified.
fn accept(token: &str, alg: Algorithm) -> Result<ValidatedClaims, JwtError> {
    let mut validation = Validation::new(alg);
    validation.insecure_disable_signature_validation();
    validation.leeway = DEFAULT_VALIDATION_LEEWAY;
    validation.validate_nbf = true;
    validation.validate_aud = false;

    let data = decode::<Map<String, Value>>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => JwtError::TokenExpired,
            _ => JwtError::TokenInvalid(e.to_string()),
        })?;

    ValidatedClaims::from_claims(data.claims)
}

/// Raw bytes first, then standard and URL-safe base64 decodings.
fn secret_candidates(secret: &str) -> Vec<Vec<u8>> {
    let mut candidates = vec![secret.as_bytes().to_vec()];
    for decoded in [STANDARD.decode(secret), URL_SAFE.decode(secret)]
        .into_iter()
        .flatten()
    {
        if !decoded.is_empty() && !candidates.contains(&decoded) {
            candidates.push(decoded);
        }
    }
    candidates
}
