//! Error types for the gateway

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing, expired or undecodable session
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Malformed request input
    #[error("Validation error: {0}")]
    Validation(String),

    /// IdP or backend unreachable or returned garbage
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Exec stream negotiation or upgrade failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Nothing is registered for the requested path
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error is reported with
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_)
            | Self::Upstream(_)
            | Self::Protocol(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Http(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable reason placed in the `Status` body
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "Unauthorized",
            Self::Validation(_) => "BadRequest",
            Self::NotFound(_) => "NotFound",
            _ => "InternalError",
        }
    }

    /// Message that is safe to hand to the client.
    ///
    /// Upstream and internal failures are logged in full but only described
    /// generically in the response body.
    fn public_message(&self) -> String {
        match self {
            Self::Unauthenticated(msg) | Self::Validation(msg) | Self::NotFound(msg) => {
                msg.clone()
            }
            Self::Protocol(_) => "failed to establish the terminal stream".to_string(),
            Self::Upstream(_) | Self::Http(_) => "upstream service unavailable".to_string(),
            _ => "internal server error".to_string(),
        }
    }
}

/// Kubernetes-style `Status` body returned on every failure
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    /// Always `Status`
    pub kind: &'static str,
    /// Always `v1`
    pub api_version: &'static str,
    /// Always `Failure`
    pub status: &'static str,
    /// Human readable message
    pub message: String,
    /// Machine readable reason
    pub reason: &'static str,
    /// HTTP status code
    pub code: u16,
}

impl StatusBody {
    /// Build a failure body for `code`
    #[must_use]
    pub fn failure(code: StatusCode, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: "Status",
            api_version: "v1",
            status: "Failure",
            message: message.into(),
            reason,
            code: code.as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = StatusBody::failure(status, self.reason(), self.public_message());
        (status, Json(body)).into_response()
    }
}
