//! Shared fixtures for the gateway integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::http::HeaderName;
use chrono::{DateTime, Utc};
use url::Url;

use tke_gateway::config::{ComponentKind, OidcConfig};
use tke_gateway::gateway::AppState;
use tke_gateway::oidc::{Identity, OidcError, OidcSession, ProviderMetadata, TokenAuthenticator};
use tke_gateway::proxy::{self, ComponentProxy, IdentityHeaders, ProxyMode, RouteTable};
use tke_gateway::token::{self, SessionToken};

/// Bearer the fake authenticator accepts
pub const GOOD_TOKEN: &str = "good-id-token";

/// Accepts [`GOOD_TOKEN`] as `alice`, rejects everything else
pub struct StaticAuthenticator;

#[async_trait]
impl TokenAuthenticator for StaticAuthenticator {
    async fn authenticate_token(&self, token: &str) -> Result<Option<Identity>, OidcError> {
        Ok((token == GOOD_TOKEN).then(alice))
    }
}

pub fn alice() -> Identity {
    Identity {
        name: "alice".to_string(),
        uid: "u-1".to_string(),
        groups: vec!["dev".to_string(), "ops".to_string()],
        extra: BTreeMap::from([("tenantid".to_string(), vec!["default".to_string()])]),
    }
}

/// Serve `router` on an ephemeral port
pub async fn spawn(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// `Cookie` header value carrying a session
pub fn session_cookie(id: &str, refresh: &str, expire: DateTime<Utc>) -> String {
    let value = token::encode_value(&SessionToken {
        id: id.to_string(),
        refresh: refresh.to_string(),
        expire,
    })
    .unwrap();
    format!("{}={value}", token::COOKIE_NAME)
}

/// A session valid for the next hour
pub fn live_cookie(id: &str) -> String {
    session_cookie(id, "refresh-1", Utc::now() + chrono::Duration::hours(1))
}

pub fn oidc_config() -> OidcConfig {
    OidcConfig {
        issuer_url: "http://idp.invalid/oidc".to_string(),
        client_id: "tke".to_string(),
        client_secret: "s3cret".to_string(),
        ..OidcConfig::default()
    }
}

/// IdP client whose endpoints live under `base`
pub fn oidc_session(base: &str) -> OidcSession {
    let metadata = ProviderMetadata {
        issuer: format!("{base}/oidc"),
        authorization_endpoint: format!("{base}/oidc/auth"),
        token_endpoint: format!("{base}/oidc/token"),
        jwks_uri: format!("{base}/oidc/keys"),
        userinfo_endpoint: None,
        end_session_endpoint: None,
        scopes_supported: vec![],
    };
    OidcSession::new(&oidc_config(), metadata, reqwest::Client::new())
}

pub fn identity_headers() -> IdentityHeaders {
    IdentityHeaders {
        username: HeaderName::from_static("x-remote-user"),
        groups: HeaderName::from_static("x-remote-group"),
        extra_prefix: "x-remote-extra-".to_string(),
    }
}

pub fn component(kind: ComponentKind, address: &str, mode: ProxyMode) -> Arc<ComponentProxy> {
    Arc::new(ComponentProxy::new(
        kind,
        Url::parse(address).unwrap(),
        mode,
        reqwest::Client::new(),
        None,
    ))
}

/// Gateway state without terminal or console
pub fn app_state(components: &[Arc<ComponentProxy>], idp_base: &str) -> AppState {
    let mut routes = RouteTable::new();
    for proxy in components {
        proxy::register(&mut routes, proxy.kind(), proxy).unwrap();
    }
    AppState {
        routes,
        oidc: Arc::new(oidc_session(idp_base)),
        authenticator: Arc::new(StaticAuthenticator),
        webtty: None,
        console_dir: None,
        external_url: None,
        default_scheme: "http",
        request_timeout: Duration::from_secs(10),
    }
}
