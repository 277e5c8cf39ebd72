//! JWT validation against an external identity provider
//!
//! **Validation modes** (any combination):
//! - Static HMAC secret (`HS256/384/512`), accepted raw or base64-encoded
//! - Remote JWKS (`RS256/384/512`, or HMAC keys published as `oct` JWKs)
//!
//! **Security properties**:
//! - Header algorithms outside the allow-list are rejected before any key lookup
//! - The verifying algorithm comes from the key, never only from the token header
//! - 30 seconds clock skew tolerance on `exp` / `nbf`
//! - JWKS refreshes are single-flight and never tear the published key map

pub mod error;
pub mod jwks;
pub mod validator;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{JwksError, JwtError};
pub use jwks::{jwks_url_for, JwksCache, JwksKey, KeyFamily, DEFAULT_JWKS_TTL};
pub use validator::{
    JwtValidator, TokenValidator, ValidatedClaims, ALLOWED_ALGORITHMS, DEFAULT_VALIDATION_LEEWAY,
};
