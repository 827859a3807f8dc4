//! OIDC session management.
//!
//! - [`ProviderMetadata`]: IdP discovery document
//! - [`OidcSession`]: password, authorization-code and refresh grants
//! - [`OidcVerifier`]: ID token verification against the IdP's JWKS
//! - [`Identity`]: claims mapped to the caller identity

mod discovery;
mod identity;
mod session;
mod verifier;

pub use discovery::ProviderMetadata;
pub use identity::{ClaimMapping, Identity, TENANT_ID_KEY};
pub use session::OidcSession;
pub use verifier::{JwksCache, OidcVerifier, unverified_expiry};

use async_trait::async_trait;

/// Error variants for the OIDC flows
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// JWT decode / signature / claim validation failed
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header contains no `kid` field
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` is not in the provider's JWKS, even after a refresh
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// Discovery returned a document for another issuer
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Configured issuer
        expected: String,
        /// Issuer in the discovery document
        actual: String,
    },

    /// The IdP rejected the grant (bad credentials, stale code or refresh token)
    #[error("Grant rejected by identity provider: {0}")]
    InvalidGrant(String),

    /// The IdP answered with an unexpected status
    #[error("Identity provider returned HTTP {status}: {body}")]
    Endpoint {
        /// HTTP status
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// Token response carried neither an ID token nor an access token
    #[error("Token response contains no token")]
    MissingToken,

    /// Network or decoding error talking to the IdP
    #[error("Identity provider request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl OidcError {
    /// Whether this failure means "the caller is not authenticated" rather
    /// than "the IdP could not be consulted"
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Jwt(_) | Self::MissingKeyId | Self::UnknownKeyId(_) | Self::InvalidGrant(_)
        )
    }
}

impl From<OidcError> for crate::Error {
    fn from(err: OidcError) -> Self {
        if err.is_rejection() {
            Self::Unauthenticated(err.to_string())
        } else {
            Self::Upstream(err.to_string())
        }
    }
}

/// Resolves a bearer token to an identity.
///
/// `Ok(None)` means the token is invalid or expired; `Err` means the
/// verification could not be carried out.
#[async_trait]
pub trait TokenAuthenticator: Send + Sync {
    /// Verify `token` and map its claims
    async fn authenticate_token(&self, token: &str) -> Result<Option<Identity>, OidcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_map_to_unauthenticated() {
        let err: crate::Error = OidcError::InvalidGrant("invalid_grant".to_string()).into();
        assert!(matches!(err, crate::Error::Unauthenticated(_)));
        let err: crate::Error = OidcError::UnknownKeyId("k9".to_string()).into();
        assert!(matches!(err, crate::Error::Unauthenticated(_)));
    }

    #[test]
    fn idp_failures_map_to_upstream() {
        let err: crate::Error = OidcError::Endpoint {
            status: 503,
            body: String::new(),
        }
        .into();
        assert!(matches!(err, crate::Error::Upstream(_)));
        let err: crate::Error = OidcError::MissingToken.into();
        assert!(matches!(err, crate::Error::Upstream(_)));
    }
}
