//! HTTP router

use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;
use url::Url;

use super::{API_PREFIX, console, tokens};
use crate::config::{ComponentKind, Config};
use crate::oidc::{OidcSession, TokenAuthenticator};
use crate::proxy::{self, ComponentProxy, ProxyTable, RouteTable};
use crate::webtty::{self, WebTtyState};
use crate::{Error, Result};

/// Shared state, built once and read-only afterwards
pub struct AppState {
    /// Component routes
    pub routes: ProxyTable,
    /// OAuth2 client
    pub oidc: Arc<OidcSession>,
    /// Bearer token verification
    pub authenticator: Arc<dyn TokenAuthenticator>,
    /// Terminal bridge, when a platform component exists
    pub webtty: Option<WebTtyState>,
    /// Console assets
    pub console_dir: Option<PathBuf>,
    /// Fixed public origin
    pub external_url: Option<Url>,
    /// Scheme assumed when no forwarding header names one
    pub default_scheme: &'static str,
    /// Time allowed to produce response headers
    pub request_timeout: Duration,
}

impl AppState {
    /// Build every component proxy and the route table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid components, duplicate routes or
    /// a malformed `external_url`.
    pub fn from_config(
        config: &Config,
        oidc: Arc<OidcSession>,
        authenticator: Arc<dyn TokenAuthenticator>,
    ) -> Result<Self> {
        let mut routes = RouteTable::new();
        let mut platform = None;
        for (kind, component) in config.components.enabled() {
            let proxy = Arc::new(ComponentProxy::from_config(
                kind,
                component,
                config.server.request_timeout,
            )?);
            proxy::register(&mut routes, kind, &proxy)?;
            if kind == ComponentKind::Platform {
                platform = Some(proxy);
            }
        }

        let webtty = match platform {
            Some(platform) => Some(WebTtyState::new(platform, &config.webtty)),
            None => {
                info!("No platform component configured, terminal disabled");
                None
            }
        };

        let external_url = config
            .server
            .external_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| Error::Config(format!("server.external_url is invalid: {e}")))?;

        Ok(Self {
            routes,
            oidc,
            authenticator,
            webtty,
            console_dir: config.console.assets_dir.as_ref().map(PathBuf::from),
            external_url,
            default_scheme: if config.server.tls_enabled() { "https" } else { "http" },
            request_timeout: config.server.request_timeout,
        })
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let tokens_path = format!("{API_PREFIX}/tokens");
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/callback", get(tokens::callback))
        .route(&tokens_path, axum::routing::post(tokens::create))
        .route(&format!("{tokens_path}/"), axum::routing::post(tokens::create))
        .route(&format!("{tokens_path}/info"), get(tokens::info))
        .route(&format!("{tokens_path}/redirect"), get(tokens::redirect))
        .route(
            &format!("{tokens_path}/renew"),
            get(tokens::renew).post(tokens::renew),
        )
        .route(&format!("{API_PREFIX}/logout"), get(tokens::logout))
        .route(&format!("{API_PREFIX}/logout/"), get(tokens::logout));

    if state.webtty.is_some() {
        router = router.route("/webtty", get(webtty::serve));
    }

    router
        .fallback(dispatch)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            state.request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Component routes first, the console for everything else
async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
    if let Some((route, proxy)) = state.routes.lookup(req.uri().path()) {
        let authenticator = state.authenticator.as_ref();
        return proxy::handle(proxy, route, authenticator, state.default_scheme, req).await;
    }
    console::serve(&state, req).await.into_response()
}
