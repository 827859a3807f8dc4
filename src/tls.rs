//! TLS material loading and client transport construction.
//!
//! Every component gets one `rustls::ClientConfig`, built once from its PEM
//! files and shared by the HTTP client and the exec stream connector:
//! - front-proxy: CA bundle plus client certificate (mutual TLS)
//! - passthrough: CA bundle only, or the platform roots when none is given

use std::{fs, path::Path, sync::Arc, time::Duration};

use rustls::{
    ClientConfig, RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use tracing::debug;

use crate::config::AuthMode;
use crate::{Error, Result};

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(Path::new(path)).map_err(|e| Error::Config(format!("Failed to read '{path}': {e}")))
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file (RSA, PKCS#8 or SEC1).
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| Error::Config(format!("Failed to parse private key from '{path}': {e}")))?
        .ok_or_else(|| Error::Config(format!("No private key found in '{path}'")))
}

fn root_store(ca_file: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("Failed to add CA cert to trust store: {e}")))?;
    }
    Ok(roots)
}

/// Build a client config trusting `ca_file`, optionally presenting a client
/// certificate.
///
/// # Errors
///
/// Returns [`Error::Config`] for unreadable PEM files or a cert/key mismatch.
pub fn client_config(ca_file: &str, identity: Option<(&str, &str)>) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Config(format!("TLS protocol setup failed: {e}")))?
    .with_root_certificates(root_store(ca_file)?);

    let mut config = match identity {
        Some((cert_file, key_file)) => builder
            .with_client_auth_cert(load_certs(cert_file)?, load_private_key(key_file)?)
            .map_err(|e| {
                Error::Config(format!("TLS client auth error (cert/key mismatch?): {e}"))
            })?,
        None => builder.with_no_client_auth(),
    };

    // The exec stream upgrades over HTTP/1.1, so both clients stay on it
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// TLS client config for a component, `None` meaning platform roots.
///
/// # Errors
///
/// See [`client_config`].
pub fn component_client_config(mode: &AuthMode) -> Result<Option<Arc<ClientConfig>>> {
    let config = match mode {
        AuthMode::FrontProxy(fp) => Some(client_config(
            &fp.ca_file,
            Some((&fp.client_cert_file, &fp.client_key_file)),
        )?),
        AuthMode::Passthrough(pt) => pt
            .ca_file
            .as_deref()
            .map(|ca| client_config(ca, None))
            .transpose()?,
    };
    debug!(mode = mode.name(), custom_roots = config.is_some(), "Component TLS built");
    Ok(config.map(Arc::new))
}

/// Build a `reqwest` client that never follows redirects.
///
/// # Errors
///
/// Returns [`Error::Config`] if the client cannot be constructed.
pub fn http_client(
    tls: Option<&Arc<ClientConfig>>,
    connect_timeout: Duration,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(connect_timeout);
    if let Some(config) = tls {
        builder = builder.use_preconfigured_tls(ClientConfig::clone(config));
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
}
