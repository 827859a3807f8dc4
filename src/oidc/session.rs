//! OAuth2 grants against the IdP and authorization redirect construction

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::{OidcError, ProviderMetadata, discovery::truncate, unverified_expiry};
use crate::config::OidcConfig;
use crate::token::SessionToken;
use crate::{Error, Result, tls};

/// Lifetime assumed when the IdP reports none
const DEFAULT_TOKEN_LIFETIME: chrono::Duration = chrono::Duration::hours(1);

/// Token endpoint response (RFC 6749 section 5.1)
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Token endpoint error (RFC 6749 section 5.2)
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth2 client for the configured IdP
pub struct OidcSession {
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    disable_oidc_proxy: bool,
    redirect_url: Option<String>,
    metadata: ProviderMetadata,
    http: Client,
}

impl OidcSession {
    /// Build the IdP HTTP client and fetch discovery metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for bad CA material and [`Error::Upstream`]
    /// when discovery fails.
    pub async fn discover(config: &OidcConfig) -> Result<Self> {
        let http = idp_client(config)?;
        let metadata = ProviderMetadata::discover(&http, &config.issuer_url).await?;
        info!(issuer = %metadata.issuer, proxied = !config.disable_oidc_proxy, "OIDC provider ready");
        Ok(Self::new(config, metadata, http))
    }

    /// Create from already discovered metadata
    #[must_use]
    pub fn new(config: &OidcConfig, metadata: ProviderMetadata, http: Client) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scopes: config.scopes.clone(),
            disable_oidc_proxy: config.disable_oidc_proxy,
            redirect_url: config.redirect_url.clone(),
            metadata,
            http,
        }
    }

    /// Discovered provider metadata
    #[must_use]
    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    /// HTTP client used towards the IdP
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Resource owner password grant.
    ///
    /// # Errors
    ///
    /// [`OidcError::InvalidGrant`] for bad credentials, other variants when
    /// the IdP cannot be reached or answers garbage.
    pub async fn password_grant(
        &self,
        username: &str,
        password: &str,
    ) -> std::result::Result<SessionToken, OidcError> {
        let scope = self.scopes.join(" ");
        let response = self
            .token_request(&[
                ("grant_type", "password"),
                ("username", username),
                ("password", password),
                ("scope", &scope),
            ])
            .await?;
        session_token(response, None, Utc::now())
    }

    /// Authorization code grant, completing the browser flow.
    ///
    /// # Errors
    ///
    /// See [`Self::password_grant`].
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> std::result::Result<SessionToken, OidcError> {
        let response = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .await?;
        session_token(response, None, Utc::now())
    }

    /// Refresh grant. A response without a new refresh token keeps the
    /// current one.
    ///
    /// # Errors
    ///
    /// See [`Self::password_grant`].
    pub async fn refresh(
        &self,
        current: &SessionToken,
    ) -> std::result::Result<SessionToken, OidcError> {
        let scope = self.scopes.join(" ");
        let response = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &current.refresh),
                ("scope", &scope),
            ])
            .await?;
        session_token(response, Some(&current.refresh), Utc::now())
    }

    /// OAuth2 redirect URI registered for this client
    #[must_use]
    pub fn redirect_uri(&self, origin: &Url) -> String {
        match &self.redirect_url {
            Some(url) => url.clone(),
            None => origin
                .join("/callback")
                .map_or_else(|_| "/callback".to_string(), String::from),
        }
    }

    /// Authorization endpoint URL carrying `state`.
    ///
    /// Unless the OIDC proxy is disabled the endpoint's origin is replaced
    /// with the gateway's own, so the browser reaches the IdP through the
    /// gateway's `/oidc/` route.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the discovered endpoint is not a URL.
    pub fn authorization_url(&self, state: &str, redirect_uri: &str, origin: &Url) -> Result<Url> {
        let mut url = Url::parse(&self.metadata.authorization_endpoint).map_err(|e| {
            Error::Internal(format!("invalid authorization endpoint: {e}"))
        })?;

        if !self.disable_oidc_proxy {
            url.set_scheme(origin.scheme())
                .map_err(|()| Error::Internal("cannot rewrite authorization scheme".to_string()))?;
            url.set_host(origin.host_str())
                .map_err(|e| Error::Internal(format!("cannot rewrite authorization host: {e}")))?;
            url.set_port(origin.port())
                .map_err(|()| Error::Internal("cannot rewrite authorization port".to_string()))?;
        }

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state);
        Ok(url)
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
    ) -> std::result::Result<TokenResponse, OidcError> {
        let grant = params.first().map_or("", |(_, v)| *v);
        debug!(grant = %grant, endpoint = %self.metadata.token_endpoint, "Requesting token");

        let response = self
            .http
            .post(&self.metadata.token_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) {
            let reason = serde_json::from_str::<TokenErrorResponse>(&body).map_or_else(
                |_| truncate(&body),
                |e| match e.error_description {
                    Some(desc) => format!("{}: {desc}", e.error),
                    None => e.error,
                },
            );
            return Err(OidcError::InvalidGrant(reason));
        }

        Err(OidcError::Endpoint {
            status: status.as_u16(),
            body: truncate(&body),
        })
    }
}

/// HTTP client for the IdP, trusting `ca_file` when configured
fn idp_client(config: &OidcConfig) -> Result<Client> {
    let tls = config
        .ca_file
        .as_deref()
        .map(|ca| tls::client_config(ca, None).map(Arc::new))
        .transpose()?;
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::none());
    if let Some(tls) = tls {
        builder = builder.use_preconfigured_tls(rustls::ClientConfig::clone(&tls));
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to build IdP client: {e}")))
}

/// Turn a token response into a session.
///
/// The bearer is the ID token when present, else the access token. Expiry
/// comes from `expires_in`, else the ID token's `exp`, else one hour.
fn session_token(
    response: TokenResponse,
    previous_refresh: Option<&str>,
    now: DateTime<Utc>,
) -> std::result::Result<SessionToken, OidcError> {
    let id = response
        .id_token
        .filter(|t| !t.is_empty())
        .or(response.access_token.filter(|t| !t.is_empty()))
        .ok_or(OidcError::MissingToken)?;

    // An out-of-range `expires_in` falls through to the other sources
    let expire = response
        .expires_in
        .filter(|secs| *secs > 0)
        .and_then(chrono::Duration::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .or_else(|| unverified_expiry(&id))
        .unwrap_or(now + DEFAULT_TOKEN_LIFETIME);

    let refresh = response
        .refresh_token
        .filter(|t| !t.is_empty())
        .or_else(|| previous_refresh.map(str::to_string))
        .unwrap_or_default();

    Ok(SessionToken {
        id,
        refresh,
        expire,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metadata() -> ProviderMetadata {
        ProviderMetadata {
            issuer: "https://tke-auth-api:9451/oidc".to_string(),
            authorization_endpoint: "https://tke-auth-api:9451/oidc/auth".to_string(),
            token_endpoint: "https://tke-auth-api:9451/oidc/token".to_string(),
            jwks_uri: "https://tke-auth-api:9451/oidc/keys".to_string(),
            userinfo_endpoint: None,
            end_session_endpoint: None,
            scopes_supported: vec![],
        }
    }

    fn session(disable_oidc_proxy: bool) -> OidcSession {
        let config = OidcConfig {
            issuer_url: "https://tke-auth-api:9451/oidc".to_string(),
            client_id: "default".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec!["openid".to_string(), "offline_access".to_string()],
            disable_oidc_proxy,
            ..OidcConfig::default()
        };
        OidcSession::new(&config, metadata(), Client::new())
    }

    fn response(id_token: Option<&str>, expires_in: Option<i64>) -> TokenResponse {
        TokenResponse {
            access_token: Some("access".to_string()),
            id_token: id_token.map(str::to_string),
            refresh_token: None,
            expires_in,
        }
    }

    #[test]
    fn proxied_authorization_url_uses_gateway_origin() {
        let origin = Url::parse("https://console.example.com").unwrap();
        let session = session(false);
        let url = session
            .authorization_url("/platform/cluster", &session.redirect_uri(&origin), &origin)
            .unwrap();

        assert_eq!(url.host_str(), Some("console.example.com"));
        assert_eq!(url.port(), None);
        assert_eq!(url.path(), "/oidc/auth");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("state".to_string(), "/platform/cluster".to_string())));
        assert!(pairs.contains(&(
            "redirect_uri".to_string(),
            "https://console.example.com/callback".to_string()
        )));
        assert!(pairs.contains(&("scope".to_string(), "openid offline_access".to_string())));
    }

    #[test]
    fn direct_authorization_url_keeps_idp_origin() {
        let origin = Url::parse("http://10.0.0.1:8080").unwrap();
        let url = session(true)
            .authorization_url("/", "http://10.0.0.1:8080/callback", &origin)
            .unwrap();
        assert_eq!(url.host_str(), Some("tke-auth-api"));
        assert_eq!(url.port(), Some(9451));
    }

    #[test]
    fn fixed_redirect_url_wins() {
        let mut session = session(false);
        session.redirect_url = Some("https://fixed/callback".to_string());
        let origin = Url::parse("https://console.example.com").unwrap();
        assert_eq!(session.redirect_uri(&origin), "https://fixed/callback");
    }

    #[test]
    fn id_token_preferred_over_access_token() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let token = session_token(response(Some("idtoken"), Some(600)), None, now).unwrap();
        assert_eq!(token.id, "idtoken");
        assert_eq!(token.expire, now + chrono::Duration::seconds(600));

        let token = session_token(response(None, Some(600)), None, now).unwrap();
        assert_eq!(token.id, "access");
    }

    #[test]
    fn expiry_defaults_to_one_hour() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let token = session_token(response(Some("opaque"), None), None, now).unwrap();
        assert_eq!(token.expire, now + chrono::Duration::hours(1));
    }

    #[test]
    fn huge_expires_in_falls_back_to_default() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        for secs in [i64::MAX, i64::MAX / 1000, 10_000_000_000_000] {
            let token = session_token(response(Some("opaque"), Some(secs)), None, now).unwrap();
            assert_eq!(token.expire, now + chrono::Duration::hours(1), "{secs}");
        }
    }

    #[test]
    fn refresh_keeps_previous_refresh_token() {
        let now = Utc::now();
        let token = session_token(response(Some("id"), Some(60)), Some("old-refresh"), now).unwrap();
        assert_eq!(token.refresh, "old-refresh");

        let mut fresh = response(Some("id"), Some(60));
        fresh.refresh_token = Some("new-refresh".to_string());
        let token = session_token(fresh, Some("old-refresh"), now).unwrap();
        assert_eq!(token.refresh, "new-refresh");
    }

    #[test]
    fn empty_response_is_error() {
        let empty = TokenResponse {
            access_token: Some(String::new()),
            id_token: None,
            refresh_token: None,
            expires_in: None,
        };
        assert!(matches!(
            session_token(empty, None, Utc::now()),
            Err(OidcError::MissingToken)
        ));
    }
}
