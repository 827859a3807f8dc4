//! Login, logout and session token endpoints

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::AppState;
use crate::token::{self, SessionToken};
use crate::{Error, Result};

/// Public origin of the gateway for this request.
///
/// A configured external URL wins; otherwise `X-Forwarded-Proto`,
/// `X-Forwarded-Host` and `Host` are consulted.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the host header does not form a URL.
pub fn request_origin(
    headers: &HeaderMap,
    external_url: Option<&Url>,
    default_scheme: &str,
) -> Result<Url> {
    if let Some(url) = external_url {
        return Ok(url.clone());
    }
    let first = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let scheme = first("x-forwarded-proto").unwrap_or(default_scheme);
    let host = first("x-forwarded-host")
        .or_else(|| first(header::HOST.as_str()))
        .unwrap_or("localhost");
    Url::parse(&format!("{scheme}://{host}/"))
        .map_err(|e| Error::Validation(format!("invalid request host {host}: {e}")))
}

/// Only same-origin absolute paths are followed after login
#[must_use]
pub fn safe_redirect(state: &str) -> &str {
    if state.starts_with('/') && !state.starts_with("//") && !state.starts_with("/\\") {
        state
    } else {
        "/"
    }
}

/// `302 Found` to `location`
pub(super) fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(e) => Error::Internal(format!("invalid redirect location: {e}")).into_response(),
    }
}

/// Redirect the browser into the authorization flow, returning to `state`
pub(super) fn login_redirect(state: &AppState, headers: &HeaderMap, target: &str) -> Result<Response> {
    let origin = request_origin(headers, state.external_url.as_ref(), state.default_scheme)?;
    let redirect_uri = state.oidc.redirect_uri(&origin);
    let url = state
        .oidc
        .authorization_url(safe_redirect(target), &redirect_uri, &origin)?;
    debug!(state = %target, "Redirecting to identity provider");
    Ok(found(url.as_str()))
}

fn with_session(jar: CookieJar, session: &SessionToken) -> Result<CookieJar> {
    let cookie = token::encode(session)
        .map_err(|e| Error::Internal(format!("failed to encode session: {e}")))?;
    Ok(jar.add(cookie))
}

/// Password grant form
#[derive(Debug, Default, Deserialize)]
pub struct PasswordForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// `POST .../tokens/`: password login, 201 with the session cookie
pub async fn create(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<PasswordForm>,
) -> Result<(StatusCode, CookieJar)> {
    if form.username.is_empty() || form.password.is_empty() {
        return Err(Error::Unauthenticated(
            "username and password are required".to_string(),
        ));
    }
    let session = state.oidc.password_grant(&form.username, &form.password).await?;
    info!(user = %form.username, "Password login succeeded");
    Ok((StatusCode::CREATED, with_session(jar, &session)?))
}

/// `GET .../tokens/info`: the identity behind the session
pub async fn info(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<crate::oidc::Identity>> {
    let session = token::valid_from_headers(&headers)?;
    state
        .authenticator
        .authenticate_token(&session.id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::Unauthenticated("bearer token rejected".to_string()))
}

/// Query of `GET .../tokens/redirect`
#[derive(Debug, Default, Deserialize)]
pub struct RedirectQuery {
    pub redirect: Option<String>,
}

/// `GET .../tokens/redirect`: start the browser login
pub async fn redirect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RedirectQuery>,
) -> Result<Response> {
    let target = query.redirect.unwrap_or_else(|| "/".to_string());
    login_redirect(&state, &headers, &target)
}

/// `GET|POST .../tokens/renew`: refresh the session.
///
/// 201 with a new cookie, 204 when the session has no refresh token.
pub async fn renew(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Response> {
    let current = token::from_headers(&headers)?;
    if !current.has_refresh() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let renewed = state.oidc.refresh(&current).await?;
    debug!(expire = %renewed.expire, "Session renewed");
    Ok((StatusCode::CREATED, with_session(jar, &renewed)?).into_response())
}

/// `GET .../logout/`: drop the session cookie
pub async fn logout(jar: CookieJar) -> (StatusCode, CookieJar) {
    (StatusCode::OK, jar.add(token::delete()))
}

/// Query of `GET /callback`
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
}

/// `GET /callback`: finish the authorization code flow
pub async fn callback(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    let (Some(code), Some(target)) = (
        query.code.filter(|c| !c.is_empty()),
        query.state.filter(|s| !s.is_empty()),
    ) else {
        return Err(Error::Internal(
            "callback is missing code or state".to_string(),
        ));
    };

    let origin = request_origin(&headers, state.external_url.as_ref(), state.default_scheme)?;
    let redirect_uri = state.oidc.redirect_uri(&origin);
    let session = state.oidc.exchange_code(&code, &redirect_uri).await?;
    info!("Browser login succeeded");

    Ok((with_session(jar, &session)?, found(safe_redirect(&target))).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_safe() {
        assert_eq!(safe_redirect("/platform/cluster?x=1"), "/platform/cluster?x=1");
        assert_eq!(safe_redirect("//evil.example.com"), "/");
        assert_eq!(safe_redirect("/\\evil.example.com"), "/");
        assert_eq!(safe_redirect("https://evil.example.com"), "/");
        assert_eq!(safe_redirect(""), "/");
    }

    #[test]
    fn origin_prefers_external_url() {
        let external = Url::parse("https://console.example.com").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("10.0.0.1"));
        let origin = request_origin(&headers, Some(&external), "http").unwrap();
        assert_eq!(origin.as_str(), "https://console.example.com/");
    }

    #[test]
    fn origin_from_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("10.0.0.1:8080"));
        assert_eq!(
            request_origin(&headers, None, "http").unwrap().as_str(),
            "http://10.0.0.1:8080/"
        );

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https, http"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("console.example.com"));
        assert_eq!(
            request_origin(&headers, None, "http").unwrap().as_str(),
            "https://console.example.com/"
        );
    }

    #[test]
    fn found_sets_location() {
        let response = found("/next");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/next");
    }
}
