//! Remote exec over the Kubernetes channel WebSocket protocol.
//!
//! Every binary frame starts with a stream id:
//! 0 stdin, 1 stdout, 2 stderr, 3 error/status, 4 resize, 255 close.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    Connector, connect_async_tls_with_config,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue, header::AUTHORIZATION, header::SEC_WEBSOCKET_PROTOCOL},
    },
};
use tracing::{debug, info};
use url::Url;

use super::message::TerminalSize;
use crate::proxy::{ComponentProxy, Credentials, ProxyMode, set_identity_headers};

/// Exec sub-protocols, newest first
pub const CHANNEL_PROTOCOLS: [&str; 5] = [
    "v5.channel.k8s.io",
    "v4.channel.k8s.io",
    "v3.channel.k8s.io",
    "v2.channel.k8s.io",
    "channel.k8s.io",
];

/// Header naming the target cluster to the platform API
pub const CLUSTER_NAME_HEADER: &str = "X-TKE-ClusterName";

const STDIN: u8 = 0;
const STDOUT: u8 = 1;
const STDERR: u8 = 2;
const ERROR: u8 = 3;
const RESIZE: u8 = 4;
const CLOSE: u8 = 255;

/// Errors opening or driving an exec stream
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The exec endpoint could not be reached or refused the upgrade
    #[error("exec connect failed: {0}")]
    Connect(String),
    /// The endpoint accepted none of the offered protocols
    #[error("exec protocol negotiation failed: {0}")]
    Negotiation(String),
    /// The remote command reported a failure
    #[error("remote command failed: {0}")]
    Remote(String),
    /// WebSocket error mid-stream
    #[error("exec stream error: {0}")]
    Transport(#[from] tungstenite::Error),
}

impl From<ExecError> for crate::Error {
    fn from(err: ExecError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Container a terminal attaches to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    pub cluster_name: String,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub command: Vec<String>,
}

/// Queue of terminal sizes the exec transport consumes
#[derive(Debug)]
pub struct TerminalSizeQueue(mpsc::Receiver<TerminalSize>);

impl TerminalSizeQueue {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<TerminalSize>) -> Self {
        Self(rx)
    }

    /// Next size, `None` once the terminal is gone
    pub async fn next(&mut self) -> Option<TerminalSize> {
        self.0.recv().await
    }
}

/// Terminal side of an exec session
#[derive(Debug)]
pub struct TerminalIo {
    pub stdin: mpsc::Receiver<Bytes>,
    /// stdout and stderr, interleaved in arrival order
    pub output: mpsc::Sender<Bytes>,
    pub sizes: TerminalSizeQueue,
}

/// Opens exec streams
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Connect and negotiate; nothing is streamed yet
    async fn connect(
        &self,
        target: &ExecTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn ExecStream>, ExecError>;
}

/// A negotiated exec stream
#[async_trait]
pub trait ExecStream: Send {
    /// Negotiated sub-protocol
    fn protocol(&self) -> &str;

    /// Pump bytes until the command exits or the terminal goes away
    async fn run(self: Box<Self>, io: TerminalIo) -> Result<(), ExecError>;
}

/// Pick the server's answer if it is one we offered
#[must_use]
pub fn select_protocol(offered: &[&str], returned: Option<&str>) -> Option<&'static str> {
    let returned = returned?.trim();
    CHANNEL_PROTOCOLS
        .iter()
        .copied()
        .find(|p| *p == returned && offered.contains(p))
}

fn protocol_version(protocol: &str) -> u8 {
    protocol
        .strip_prefix('v')
        .and_then(|rest| rest.split('.').next())
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

/// Executes against the platform component's pod exec endpoint
pub struct ChannelExecutor {
    platform: Arc<ComponentProxy>,
}

impl ChannelExecutor {
    #[must_use]
    pub fn new(platform: Arc<ComponentProxy>) -> Self {
        Self { platform }
    }

    /// `ws(s)://.../api/v1/namespaces/{ns}/pods/{pod}/exec?...`
    pub fn exec_url(&self, target: &ExecTarget) -> Result<Url, ExecError> {
        let mut url = self.platform.base().clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| ExecError::Connect(format!("cannot use {scheme} for {url}")))?;
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!(
            "{base_path}/api/v1/namespaces/{}/pods/{}/exec",
            target.namespace, target.pod_name
        ));
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("container", &target.container_name);
            for arg in &target.command {
                query.append_pair("command", arg);
            }
            query
                .append_pair("stdin", "true")
                .append_pair("stdout", "true")
                .append_pair("stderr", "true")
                .append_pair("tty", "true");
        }
        Ok(url)
    }
}

#[async_trait]
impl RemoteExecutor for ChannelExecutor {
    async fn connect(
        &self,
        target: &ExecTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn ExecStream>, ExecError> {
        let url = self.exec_url(target)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ExecError::Connect(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&CHANNEL_PROTOCOLS.join(", "))
                .map_err(|e| ExecError::Connect(e.to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("x-tke-clustername"),
            HeaderValue::from_str(&target.cluster_name)
                .map_err(|e| ExecError::Connect(format!("invalid cluster name: {e}")))?,
        );
        match (credentials, self.platform.mode()) {
            (Credentials::Bearer(id), _) => {
                let value = HeaderValue::from_str(&format!("Bearer {id}"))
                    .map_err(|e| ExecError::Connect(e.to_string()))?;
                headers.insert(AUTHORIZATION, value);
            }
            (Credentials::Identity(identity), ProxyMode::FrontProxy(names)) => {
                set_identity_headers(headers, names, identity);
            }
            (Credentials::Identity(_), ProxyMode::Passthrough) => {}
        }

        let connector = self.platform.tls().map(|tls| Connector::Rustls(Arc::clone(tls)));
        debug!(url = %url, cluster = %target.cluster_name, "Opening exec stream");
        let (socket, response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Protocol(p) => ExecError::Negotiation(p.to_string()),
                other => ExecError::Connect(other.to_string()),
            })?;

        let returned = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        let protocol = select_protocol(&CHANNEL_PROTOCOLS, returned).ok_or_else(|| {
            ExecError::Negotiation(format!(
                "server selected {}",
                returned.unwrap_or("no protocol")
            ))
        })?;

        info!(
            cluster = %target.cluster_name,
            namespace = %target.namespace,
            pod = %target.pod_name,
            container = %target.container_name,
            protocol,
            "Exec stream negotiated"
        );
        Ok(Box::new(ChannelStream { socket, protocol }))
    }
}

type ExecSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct ChannelStream {
    socket: ExecSocket,
    protocol: &'static str,
}

/// v4+ error stream payload
#[derive(Debug, Deserialize)]
struct ExecStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

fn frame(stream: u8, payload: &[u8]) -> Message {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(stream);
    data.extend_from_slice(payload);
    Message::binary(data)
}

/// Turn an error stream payload into the command's outcome
fn status_outcome(version: u8, payload: &[u8]) -> Result<(), ExecError> {
    if version >= 4 {
        let status: ExecStatus = serde_json::from_slice(payload)
            .map_err(|e| ExecError::Remote(format!("unreadable status: {e}")))?;
        if status.status == "Success" {
            Ok(())
        } else {
            Err(ExecError::Remote(status.message))
        }
    } else if payload.is_empty() {
        Ok(())
    } else {
        Err(ExecError::Remote(String::from_utf8_lossy(payload).into_owned()))
    }
}

#[async_trait]
impl ExecStream for ChannelStream {
    fn protocol(&self) -> &str {
        self.protocol
    }

    async fn run(self: Box<Self>, io: TerminalIo) -> Result<(), ExecError> {
        let version = protocol_version(self.protocol);
        let (mut sink, mut stream) = self.socket.split();
        let TerminalIo {
            mut stdin,
            output,
            mut sizes,
        } = io;

        let upstream = async {
            loop {
                tokio::select! {
                    data = stdin.recv() => match data {
                        Some(data) => sink.send(frame(STDIN, &data)).await?,
                        None => break,
                    },
                    Some(size) = sizes.next() => {
                        // v1 and v2 have no resize stream
                        if version >= 3 {
                            let payload = serde_json::to_vec(&size)
                                .map_err(|e| ExecError::Remote(e.to_string()))?;
                            sink.send(frame(RESIZE, &payload)).await?;
                        }
                    }
                }
            }
            if version >= 5 {
                sink.send(frame(CLOSE, &[STDIN])).await?;
            }
            sink.close().await?;
            Ok::<(), ExecError>(())
        };

        let downstream = async {
            while let Some(message) = stream.next().await {
                match message? {
                    Message::Binary(data) => match data.first() {
                        Some(&(STDOUT | STDERR)) => {
                            if output.send(data.slice(1..)).await.is_err() {
                                break;
                            }
                        }
                        Some(&ERROR) => return status_outcome(version, &data[1..]),
                        _ => {}
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Ok(())
        };

        tokio::select! {
            result = upstream => result,
            result = downstream => result,
        }
    }
}
