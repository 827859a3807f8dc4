//! Per-component authentication treatment

use std::{sync::Arc, time::Duration};

use axum::http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{AUTHORIZATION, COOKIE},
};
use rustls::ClientConfig;
use tracing::debug;
use url::Url;

use crate::config::{AuthMode, ComponentConfig, ComponentKind, FrontProxyConfig};
use crate::oidc::{Identity, TokenAuthenticator};
use crate::{Error, Result, tls, token};

/// Header names a front-proxy component reads the caller identity from
#[derive(Debug, Clone)]
pub struct IdentityHeaders {
    pub username: HeaderName,
    pub groups: HeaderName,
    /// Lowercased prefix; one header per extra key
    pub extra_prefix: String,
}

impl IdentityHeaders {
    fn from_config(kind: ComponentKind, config: &FrontProxyConfig) -> Result<Self> {
        let parse = |field: &str, value: &str| {
            HeaderName::try_from(value).map_err(|e| {
                Error::Config(format!("components.{kind}.front_proxy.{field}: {e}"))
            })
        };
        let extra_prefix = config.extra_prefix_header.to_ascii_lowercase();
        parse("extra_prefix_header", &format!("{extra_prefix}probe"))?;
        Ok(Self {
            username: parse("username_header", &config.username_header)?,
            groups: parse("groups_header", &config.groups_header)?,
            extra_prefix,
        })
    }

    fn is_identity_header(&self, name: &HeaderName) -> bool {
        *name == self.username
            || *name == self.groups
            || name.as_str().starts_with(&self.extra_prefix)
    }
}

/// Authentication treatment selected once per component
#[derive(Debug, Clone)]
pub enum ProxyMode {
    /// Session translated into identity headers, mutual TLS upstream
    FrontProxy(IdentityHeaders),
    /// Session forwarded as a bearer token, one-way TLS upstream
    Passthrough,
}

/// What a protected request carries to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Identity(Identity),
}

/// A component's address, auth mode and transports, built once at startup
/// and shared by every request to it
pub struct ComponentProxy {
    kind: ComponentKind,
    base: Url,
    mode: ProxyMode,
    client: reqwest::Client,
    tls: Option<Arc<ClientConfig>>,
}

impl std::fmt::Debug for ComponentProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentProxy")
            .field("kind", &self.kind)
            .field("base", &self.base.as_str())
            .field("mode", &self.mode_name())
            .finish_non_exhaustive()
    }
}

impl ComponentProxy {
    /// Validate the component and build its transports.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid address, auth mode, header
    /// name or TLS material.
    pub fn from_config(
        kind: ComponentKind,
        config: &ComponentConfig,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let auth_mode = config.auth_mode(kind)?;
        let base = config.address_url(kind)?;
        let tls = tls::component_client_config(&auth_mode)?;
        let client = tls::http_client(tls.as_ref(), connect_timeout)?;
        let mode = match &auth_mode {
            AuthMode::FrontProxy(fp) => {
                ProxyMode::FrontProxy(IdentityHeaders::from_config(kind, fp)?)
            }
            AuthMode::Passthrough(_) => ProxyMode::Passthrough,
        };
        debug!(component = %kind, address = %base, mode = auth_mode.name(), "Component proxy built");
        Ok(Self::new(kind, base, mode, client, tls))
    }

    /// Assemble from parts
    #[must_use]
    pub fn new(
        kind: ComponentKind,
        base: Url,
        mode: ProxyMode,
        client: reqwest::Client,
        tls: Option<Arc<ClientConfig>>,
    ) -> Self {
        Self {
            kind,
            base,
            mode,
            client,
            tls,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }

    #[must_use]
    pub fn mode(&self) -> &ProxyMode {
        &self.mode
    }

    #[must_use]
    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            ProxyMode::FrontProxy(_) => "front-proxy",
            ProxyMode::Passthrough => "passthrough",
        }
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// TLS config for non-HTTP connections (the exec stream); `None`
    /// means platform roots
    #[must_use]
    pub fn tls(&self) -> Option<&Arc<ClientConfig>> {
        self.tls.as_ref()
    }

    /// Authenticate the caller from the session cookie.
    ///
    /// Passthrough only requires a decodable, unexpired session since the
    /// backend validates the bearer itself. Front-proxy additionally
    /// verifies the bearer and resolves the identity.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthenticated`] for a missing, expired or rejected
    /// session; [`Error::Upstream`] if the IdP cannot be consulted.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        authenticator: &dyn TokenAuthenticator,
    ) -> Result<Credentials> {
        let session = token::valid_from_headers(headers)?;
        match self.mode {
            ProxyMode::Passthrough => {
                if HeaderValue::from_str(&format!("Bearer {}", session.id)).is_err() {
                    return Err(Error::Unauthenticated(
                        "session bearer is not a valid header value".to_string(),
                    ));
                }
                Ok(Credentials::Bearer(session.id))
            }
            ProxyMode::FrontProxy(_) => authenticator
                .authenticate_token(&session.id)
                .await?
                .map(Credentials::Identity)
                .ok_or_else(|| Error::Unauthenticated("bearer token rejected".to_string())),
        }
    }

    /// Mutate outbound headers for this component.
    ///
    /// Front-proxy mode never forwards the session cookie or client-supplied
    /// identity headers, whether or not the route is protected.
    pub fn apply_credentials(&self, headers: &mut HeaderMap, credentials: Option<&Credentials>) {
        if let ProxyMode::FrontProxy(names) = &self.mode {
            headers.remove(COOKIE);
            let spoofed: Vec<HeaderName> = headers
                .keys()
                .filter(|name| names.is_identity_header(name))
                .cloned()
                .collect();
            for name in spoofed {
                headers.remove(&name);
            }
        }

        match (credentials, &self.mode) {
            (Some(Credentials::Identity(identity)), ProxyMode::FrontProxy(names)) => {
                set_identity_headers(headers, names, identity);
            }
            (Some(Credentials::Bearer(id)), _) => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {id}")) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
            _ => {}
        }
    }
}

/// Write `identity` into the configured headers. Values that are not valid
/// header text are skipped.
pub fn set_identity_headers(headers: &mut HeaderMap, names: &IdentityHeaders, identity: &Identity) {
    if let Ok(value) = HeaderValue::from_str(&identity.name) {
        headers.insert(names.username.clone(), value);
    }
    for group in &identity.groups {
        if let Ok(value) = HeaderValue::from_str(group) {
            headers.append(names.groups.clone(), value);
        }
    }
    for (key, values) in &identity.extra {
        let Ok(name) = HeaderName::try_from(format!("{}{}", names.extra_prefix, key.to_ascii_lowercase()))
        else {
            continue;
        };
        for v in values {
            if let Ok(value) = HeaderValue::from_str(v) {
                headers.append(name.clone(), value);
            }
        }
    }
}
