//! `GET /webtty`: validate, authenticate, negotiate, then upgrade

use std::sync::Arc;

use axum::{
    extract::{
        Query, State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use super::exec::ExecTarget;
use super::session::bridge;
use crate::gateway::AppState;
use crate::{Error, Result};

/// Query string of a terminal request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalQuery {
    pub cluster_name: Option<String>,
    pub namespace: Option<String>,
    pub pod_name: Option<String>,
    pub container_name: Option<String>,
    pub command: Option<String>,
}

impl TerminalQuery {
    /// Require every locator; `command` falls back to `default_command`
    /// and is split on whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first missing parameter.
    pub fn into_target(self, default_command: &str) -> Result<ExecTarget> {
        fn required(value: Option<String>, name: &str) -> Result<String> {
            value
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Validation(format!("{name} is required")))
        }

        let cluster_name = required(self.cluster_name, "clusterName")?;
        let namespace = required(self.namespace, "namespace")?;
        let pod_name = required(self.pod_name, "podName")?;
        let container_name = required(self.container_name, "containerName")?;
        let command = self
            .command
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| default_command.to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Ok(ExecTarget {
            cluster_name,
            namespace,
            pod_name,
            container_name,
            command,
        })
    }
}

/// Terminal endpoint. Nothing is upgraded unless the parameters are
/// complete, the session is valid and the exec stream is negotiated.
pub async fn serve(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TerminalQuery>,
    headers: HeaderMap,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match open(&state, query, &headers, upgrade).await {
        Ok(response) => response,
        Err(e) => {
            if matches!(e, Error::Unauthenticated(_)) {
                warn!(reason = %e, "Rejected terminal request");
            }
            e.into_response()
        }
    }
}

async fn open(
    state: &AppState,
    query: TerminalQuery,
    headers: &HeaderMap,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let webtty = state
        .webtty
        .as_ref()
        .ok_or_else(|| Error::NotFound("terminal is not enabled".to_string()))?;

    let target = query.into_target(&webtty.default_command)?;
    let credentials = webtty
        .platform
        .authenticate(headers, state.authenticator.as_ref())
        .await?;

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let exec = webtty.executor.connect(&target, &credentials).await?;
    let buffer = webtty.buffer_size;
    Ok(upgrade.on_upgrade(move |socket| async move {
        info!(
            cluster = %target.cluster_name,
            namespace = %target.namespace,
            pod = %target.pod_name,
            container = %target.container_name,
            protocol = exec.protocol(),
            "Terminal session started"
        );
        match bridge(socket, exec, buffer).await {
            Ok(()) => info!(pod = %target.pod_name, "Terminal session closed"),
            Err(e) => warn!(pod = %target.pod_name, error = %e, "Terminal session ended with error"),
        }
    }))
}
