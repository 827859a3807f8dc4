//! Browser terminal bridged to a container exec stream.
//!
//! A session moves through validation, authentication and exec
//! negotiation before the browser connection is upgraded. Once streaming,
//! a read loop and a write loop run independently until either peer goes
//! away.

mod exec;
mod handler;
mod message;
mod session;

pub use exec::{
    CHANNEL_PROTOCOLS, CLUSTER_NAME_HEADER, ChannelExecutor, ExecError, ExecStream, ExecTarget,
    RemoteExecutor, TerminalIo, TerminalSizeQueue, select_protocol,
};
pub use handler::{TerminalQuery, serve};
pub use message::{TerminalMessage, TerminalSize, Utf8Chunker};
pub use session::{CloseSignal, bridge, read_loop, write_loop};

use std::sync::Arc;

use crate::config::WebTtyConfig;
use crate::proxy::ComponentProxy;

/// Everything the terminal endpoint needs; present only when a platform
/// component is configured
pub struct WebTtyState {
    pub platform: Arc<ComponentProxy>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub buffer_size: usize,
    pub default_command: String,
}

impl WebTtyState {
    /// Terminal backed by the platform's pod exec endpoint
    #[must_use]
    pub fn new(platform: Arc<ComponentProxy>, config: &WebTtyConfig) -> Self {
        Self::with_executor(
            Arc::clone(&platform),
            Arc::new(ChannelExecutor::new(platform)),
            config,
        )
    }

    /// Terminal backed by any executor
    #[must_use]
    pub fn with_executor(
        platform: Arc<ComponentProxy>,
        executor: Arc<dyn RemoteExecutor>,
        config: &WebTtyConfig,
    ) -> Self {
        Self {
            platform,
            executor,
            buffer_size: config.buffer_size.max(1),
            default_command: config.default_command.clone(),
        }
    }
}
