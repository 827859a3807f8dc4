//! OpenID provider metadata discovery

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::OidcError;

/// Subset of the OpenID Connect discovery document the gateway uses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier, must equal the configured issuer
    pub issuer: String,
    /// Browser authorization endpoint
    pub authorization_endpoint: String,
    /// Token endpoint (all grants)
    pub token_endpoint: String,
    /// Signing keys
    pub jwks_uri: String,
    /// Userinfo endpoint (optional)
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    /// RP-initiated logout endpoint (optional)
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    /// Advertised scopes
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Fetch `{issuer}/.well-known/openid-configuration`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is unreachable, malformed or names
    /// a different issuer.
    pub async fn discover(client: &Client, issuer: &str) -> Result<Self, OidcError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(url = %url, "Discovering OpenID provider metadata");

        let response = client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OidcError::Endpoint {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let metadata: Self = response.json().await?;
        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(OidcError::IssuerMismatch {
                expected: issuer.to_string(),
                actual: metadata.issuer,
            });
        }

        debug!(
            issuer = %metadata.issuer,
            token_endpoint = %metadata.token_endpoint,
            "Discovered OpenID provider"
        );
        Ok(metadata)
    }
}

/// Keep IdP error bodies short enough for a log line
pub(crate) fn truncate(body: &str) -> String {
    const LIMIT: usize = 256;
    match body.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
