use thiserror::Error;

/// Failures of the remote key cache.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JwksError {
    /// The `kid` is absent from the key set even after a fresh fetch.
    #[error("key {0} not found in JWKS")]
    KeyNotFound(String),

    /// Network, status or parse failure against the JWKS endpoint.
    #[error("JWKS upstream failure: {0}")]
    Upstream(String),

    #[error("JWKS misconfigured: {0}")]
    Misconfigured(String),
}

/// Classified token validation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("token expired")]
    TokenExpired,

    #[error("token invalid: {0}")]
    TokenInvalid(String),

    #[error("token missing required claim: {0}")]
    TokenMissingClaim(&'static str),

    #[error("signing key {0} not found")]
    KeyNotFound(String),

    #[error("no validation method available for token")]
    ValidationMethodUnavailable,
}

impl JwtError {
    /// Rank used when combining the outcomes of several validation attempts.
    /// Higher wins.
    pub(crate) fn priority(&self) -> u8 {
        match self {
            JwtError::TokenExpired => 4,
            JwtError::KeyNotFound(_) => 3,
            JwtError::TokenInvalid(_) | JwtError::TokenMissingClaim(_) => 2,
            JwtError::ValidationMethodUnavailable => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(JwtError::TokenExpired.priority() > JwtError::KeyNotFound("k".into()).priority());
        assert!(
            JwtError::KeyNotFound("k".into()).priority()
                > JwtError::TokenInvalid("bad".into()).priority()
        );
        assert!(
            JwtError::TokenInvalid("bad".into()).priority()
                > JwtError::ValidationMethodUnavailable.priority()
        );
    }
}
