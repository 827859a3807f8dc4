//! Request forwarding to a component

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use super::{ComponentProxy, Credentials, RouteSpec};
use crate::oidc::TokenAuthenticator;
use crate::{Error, Result};

/// Headers that describe one connection and are never forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Serve one request matched to `route`. `client_scheme` is the scheme the
/// client used to reach the gateway.
///
/// Authentication failures become a 401 `Status` body; the browser
/// redirect is the console handler's job, not this one's.
pub async fn handle(
    proxy: &ComponentProxy,
    route: &RouteSpec,
    authenticator: &dyn TokenAuthenticator,
    client_scheme: &str,
    req: Request,
) -> Response {
    let credentials = if route.protected {
        match proxy.authenticate(req.headers(), authenticator).await {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                if matches!(e, Error::Unauthenticated(_)) {
                    warn!(
                        component = %proxy.kind(),
                        path = %req.uri().path(),
                        reason = %e,
                        "Rejected unauthenticated request"
                    );
                }
                return e.into_response();
            }
        }
    } else {
        None
    };

    match forward(proxy, route, credentials.as_ref(), client_scheme, req).await {
        Ok(response) => response,
        Err(e) => {
            error!(component = %proxy.kind(), error = %e, "Proxy transport failed");
            e.into_response()
        }
    }
}

/// Forward `req` unchanged apart from headers and, for rewrite routes, path.
///
/// # Errors
///
/// Returns [`Error::Upstream`] if the component cannot be reached.
pub async fn forward(
    proxy: &ComponentProxy,
    route: &RouteSpec,
    credentials: Option<&Credentials>,
    client_scheme: &str,
    req: Request,
) -> Result<Response> {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = req.into_parts();

    let mut url = proxy.base().clone();
    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base_path}{}", route.upstream_path(parts.uri.path())));
    url.set_query(parts.uri.query());

    let mut headers = request_headers(&parts.headers, client_addr, client_scheme);
    proxy.apply_credentials(&mut headers, credentials);

    let upstream = proxy
        .client()
        .request(parts.method, url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await
        .map_err(|e| Error::Upstream(format!("{}: {e}", proxy.kind())))?;

    let mut response = Response::builder().status(upstream.status());
    if let Some(out) = response.headers_mut() {
        copy_end_to_end(upstream.headers(), out);
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| Error::Internal(format!("failed to build proxied response: {e}")))
}

/// Outbound request headers: end-to-end headers plus `X-Forwarded-*`
fn request_headers(
    incoming: &HeaderMap,
    client_addr: Option<SocketAddr>,
    client_scheme: &str,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 3);
    copy_end_to_end(incoming, &mut headers);
    headers.remove(header::HOST);

    if let Some(addr) = client_addr {
        let chain = match incoming.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {}", addr.ip()),
            None => addr.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if !headers.contains_key(&X_FORWARDED_HOST)
        && let Some(host) = incoming.get(header::HOST)
    {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    if !headers.contains_key(&X_FORWARDED_PROTO)
        && let Ok(value) = HeaderValue::from_str(client_scheme)
    {
        headers.insert(X_FORWARDED_PROTO, value);
    }
    headers
}

/// Copy every header not tied to a single connection, including any named
/// by `Connection`
fn copy_end_to_end(from: &HeaderMap, to: &mut HeaderMap) {
    let named_by_connection: Vec<String> = from
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    for (name, value) in from {
        if HOP_BY_HOP.contains(name) || named_by_connection.iter().any(|n| n == name.as_str()) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_and_host_are_dropped() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, HeaderValue::from_static("console.example.com"));
        incoming.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        incoming.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        incoming.insert("x-trace", HeaderValue::from_static("1"));
        incoming.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        incoming.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        let headers = request_headers(&incoming, None, "https");

        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-trace").is_none());
        assert!(headers.get(header::UPGRADE).is_none());
        assert_eq!(headers[header::ACCEPT], "*/*");
        assert_eq!(headers[X_FORWARDED_HOST], "console.example.com");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
    }

    #[test]
    fn forwarded_for_is_appended() {
        let mut incoming = HeaderMap::new();
        incoming.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.9"));
        let addr: SocketAddr = "10.1.2.3:55000".parse().unwrap();

        let headers = request_headers(&incoming, Some(addr), "http");
        assert_eq!(headers[X_FORWARDED_FOR], "203.0.113.9, 10.1.2.3");
    }

    #[test]
    fn forwarded_proto_keeps_client_value() {
        let mut incoming = HeaderMap::new();
        incoming.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        let headers = request_headers(&incoming, None, "http");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
    }

    #[test]
    fn repeated_headers_survive() {
        let mut incoming = HeaderMap::new();
        incoming.append(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        incoming.append(header::ACCEPT_LANGUAGE, HeaderValue::from_static("zh"));
        let headers = request_headers(&incoming, None, "http");
        assert_eq!(headers.get_all(header::ACCEPT_LANGUAGE).iter().count(), 2);
    }
}
