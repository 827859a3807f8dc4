//! TKE Gateway Library
//!
//! Tenant-facing edge process in front of the platform components.
//!
//! # Features
//!
//! - **Sessions**: OIDC password and authorization-code logins held in a
//!   client-side `tke` cookie, with refresh and logout
//! - **Component proxy**: longest-prefix routing to backends in front-proxy
//!   (mutual TLS plus identity headers) or passthrough (bearer) mode
//! - **WebTTY**: browser terminals bridged to container exec streams
//! - **Console**: static assets and login redirects for the web console

#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod oidc;
pub mod proxy;
pub mod tls;
pub mod token;
pub mod webtty;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging. `RUST_LOG` overrides `level`.
///
/// # Errors
///
/// Returns [`Error::Config`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
