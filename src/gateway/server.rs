//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum_server::{Handle, tls_rustls::RustlsConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::oidc::{OidcSession, OidcVerifier};
use crate::proxy::MatchKind;
use crate::{Error, Result};

/// Edge gateway: owns the route table, the OIDC client and the listener
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
}

impl Gateway {
    /// Discover the IdP and build every component proxy.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the IdP cannot
    /// be discovered.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let oidc = OidcSession::discover(&config.oidc).await?;
        let verifier = OidcVerifier::new(&config.oidc, oidc.metadata(), oidc.http().clone());
        let state = AppState::from_config(&config, Arc::new(oidc), Arc::new(verifier))?;

        Ok(Self {
            config,
            state: Arc::new(state),
        })
    }

    /// Assemble from prebuilt state
    #[must_use]
    pub fn with_state(config: Config, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Serve until Ctrl-C or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or TLS material
    /// cannot be loaded.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        self.banner();

        let app = create_router(Arc::clone(&self.state))
            .into_make_service_with_connect_info::<SocketAddr>();

        match (
            &self.config.server.tls_cert_file,
            &self.config.server.tls_key_file,
        ) {
            (Some(cert), Some(key)) => {
                let tls = RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| Error::Config(format!("Failed to load listener TLS: {e}")))?;

                let handle = Handle::new();
                let shutdown_handle = handle.clone();
                let grace = self.config.server.shutdown_timeout;
                tokio::spawn(async move {
                    shutdown_signal().await;
                    shutdown_handle.graceful_shutdown(Some(grace));
                });

                info!(%addr, "Listening (TLS)");
                axum_server::bind_rustls(addr, tls)
                    .handle(handle)
                    .serve(app)
                    .await?;
            }
            _ => {
                let listener = TcpListener::bind(addr).await?;
                info!(%addr, "Listening");
                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown_signal())
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?;
            }
        }

        info!("Gateway stopped");
        Ok(())
    }

    fn banner(&self) {
        info!("============================================================");
        info!("TKE GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(
            host = %self.config.server.host,
            port = %self.config.server.port,
            tls = self.config.server.tls_enabled(),
            "Listener"
        );
        info!(
            issuer = %self.state.oidc.metadata().issuer,
            proxied = !self.config.oidc.disable_oidc_proxy,
            "OIDC"
        );
        for route in self.state.routes.routes() {
            info!(
                "  {:<7} {:<48} {:<12} {}",
                if route.kind == MatchKind::Exact { "exact" } else { "prefix" },
                route.path,
                route.component.as_str(),
                if route.protected { "protected" } else { "public" }
            );
        }
        if self.state.webtty.is_some() {
            info!("  exact   /webtty (terminal)");
        } else {
            warn!("Terminal disabled: no platform component");
        }
        match &self.state.console_dir {
            Some(dir) => info!(dir = %dir.display(), "Console assets"),
            None => info!("Console disabled"),
        }
        info!("============================================================");
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
