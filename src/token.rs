//! Session token cookie codec.
//!
//! The `tke` cookie holds base64 of a compact JSON document
//! `{"i": id, "r": refresh, "e": expire}`. The cookie is a bearer token
//! container and carries no integrity protection of its own; trust comes
//! from the signature on the ID token it wraps.

use axum::http::HeaderMap;
use axum_extra::extract::{CookieJar, cookie::Cookie};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the session cookie
pub const COOKIE_NAME: &str = "tke";

/// Errors decoding a cookie value
#[derive(Debug, Error)]
pub enum CodecError {
    /// No `tke` cookie on the request
    #[error("session cookie not present")]
    Missing,
    /// Cookie value is not base64
    #[error("session cookie is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Decoded bytes are not the expected JSON document
    #[error("session cookie is not a valid token document: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for crate::Error {
    fn from(err: CodecError) -> Self {
        Self::Unauthenticated(err.to_string())
    }
}

/// Client-held session: bearer id, refresh token and expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    /// Bearer token (the OIDC ID token)
    #[serde(rename = "i")]
    pub id: String,
    /// Refresh token; empty when the IdP issued none
    #[serde(rename = "r", default)]
    pub refresh: String,
    /// Absolute expiry
    #[serde(rename = "e")]
    pub expire: DateTime<Utc>,
}

impl SessionToken {
    /// A token is usable only with a non-empty id and an expiry in the future
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.id.is_empty() && self.expire > now
    }

    /// [`Self::is_valid_at`] against the current time
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Whether a refresh can be attempted
    #[must_use]
    pub fn has_refresh(&self) -> bool {
        !self.refresh.is_empty()
    }
}

/// Serialize a token to its cookie value
///
/// # Errors
///
/// Only fails if JSON serialization fails, which cannot happen for the
/// field types involved but is propagated rather than unwrapped.
pub fn encode_value(token: &SessionToken) -> Result<String, CodecError> {
    let json = serde_json::to_vec(token)?;
    Ok(STANDARD.encode(json))
}

/// Parse a cookie value. Expiry is not checked here.
///
/// # Errors
///
/// Returns [`CodecError`] on malformed base64 or JSON.
pub fn decode_value(value: &str) -> Result<SessionToken, CodecError> {
    let bytes = STANDARD.decode(value.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Build the `Set-Cookie` for `token`.
///
/// `Max-Age` is the number of seconds until expiry, clamped to zero when the
/// token has already expired so the browser drops it.
///
/// # Errors
///
/// See [`encode_value`].
pub fn encode(token: &SessionToken) -> Result<Cookie<'static>, CodecError> {
    encode_at(token, Utc::now())
}

fn encode_at(token: &SessionToken, now: DateTime<Utc>) -> Result<Cookie<'static>, CodecError> {
    let max_age = (token.expire - now).num_seconds().max(0);
    Ok(Cookie::build((COOKIE_NAME, encode_value(token)?))
        .http_only(true)
        .path("/")
        .max_age(time::Duration::seconds(max_age))
        .build())
}

/// Cookie instructing the browser to drop the session
#[must_use]
pub fn delete() -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, ""))
        .http_only(true)
        .path("/")
        .max_age(time::Duration::seconds(-1))
        .build()
}

/// Read and decode the session cookie from request headers
///
/// # Errors
///
/// Returns [`CodecError::Missing`] when no `tke` cookie is sent, otherwise
/// the decode failure.
pub fn from_headers(headers: &HeaderMap) -> Result<SessionToken, CodecError> {
    let jar = CookieJar::from_headers(headers);
    let cookie = jar.get(COOKIE_NAME).ok_or(CodecError::Missing)?;
    decode_value(cookie.value())
}

/// Read the session cookie and require it to be valid now
///
/// # Errors
///
/// Returns [`crate::Error::Unauthenticated`] for a missing, malformed,
/// empty or expired token.
pub fn valid_from_headers(headers: &HeaderMap) -> crate::Result<SessionToken> {
    let token = from_headers(headers)?;
    if token.is_valid() {
        Ok(token)
    } else {
        Err(crate::Error::Unauthenticated(
            "session token is empty or expired".to_string(),
        ))
    }
}
