//! Browser side of a terminal session: the read loop, the write loop and
//! the close signal both observe.

use std::{fmt::Display, sync::Arc};

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::exec::{ExecError, ExecStream, TerminalIo, TerminalSizeQueue};
use super::message::{TerminalMessage, TerminalSize, Utf8Chunker};

/// Closed-once flag shared by both loops
///
/// ```
/// use tke_gateway::webtty::CloseSignal;
///
/// # tokio_test::block_on(async {
/// let signal = CloseSignal::new();
/// assert!(signal.close());
/// assert!(!signal.close());
/// signal.closed().await;
/// # });
/// ```
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: Mutex<bool>,
    token: CancellationToken,
}

impl CloseSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the session. Returns `true` only for the call that actually
    /// closed it; later calls are no-ops.
    pub fn close(&self) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return false;
        }
        *closed = true;
        self.token.cancel();
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Resolves once [`Self::close`] has been called
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}

/// Run one terminal session until either side ends it.
///
/// The socket is split: a read loop feeds stdin and the resize queue, a
/// write loop drains command output. The write loop owns the sink and
/// closes it exactly once, after flushing whatever output was produced.
///
/// # Errors
///
/// Returns the exec stream's failure, if any.
pub async fn bridge<S, E>(
    socket: S,
    exec: Box<dyn ExecStream>,
    buffer: usize,
) -> Result<(), ExecError>
where
    S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
    <S as Sink<Message>>::Error: Display + Send,
    E: Display + Send + 'static,
{
    let (sink, stream) = socket.split();
    let close = Arc::new(CloseSignal::new());
    let (stdin_tx, stdin_rx) = mpsc::channel(buffer);
    let (output_tx, output_rx) = mpsc::channel(buffer);
    let (size_tx, size_rx) = mpsc::channel(buffer);

    let reader = tokio::spawn(read_loop(stream, stdin_tx, size_tx, Arc::clone(&close)));
    let writer = tokio::spawn(write_loop(sink, output_rx, Arc::clone(&close)));

    let io = TerminalIo {
        stdin: stdin_rx,
        output: output_tx,
        sizes: TerminalSizeQueue::new(size_rx),
    };
    let result = tokio::select! {
        result = exec.run(io) => result,
        () = close.closed() => Ok(()),
    };
    close.close();

    if let Err(e) = writer.await {
        warn!(error = %e, "Terminal write loop panicked");
    }
    if let Err(e) = reader.await {
        warn!(error = %e, "Terminal read loop panicked");
    }
    result
}

/// Browser to stdin. Frames are applied in arrival order.
pub async fn read_loop<R, E>(
    mut stream: R,
    stdin: mpsc::Sender<Bytes>,
    sizes: mpsc::Sender<TerminalSize>,
    close: Arc<CloseSignal>,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            () = close.closed() => break,
        };
        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "Terminal socket read failed");
                break;
            }
        };

        let delivered = match serde_json::from_str::<TerminalMessage>(text.as_str()) {
            Ok(TerminalMessage::Input { input }) => stdin.send(Bytes::from(input)).await.is_ok(),
            Ok(TerminalMessage::Resize { rows, cols }) => {
                sizes.send(TerminalSize::new(cols, rows)).await.is_ok()
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed terminal frame");
                true
            }
        };
        if !delivered {
            break;
        }
    }
    close.close();
}

/// Command output to the browser as text frames, then a single sink close
pub async fn write_loop<W>(mut sink: W, mut output: mpsc::Receiver<Bytes>, close: Arc<CloseSignal>)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut chunker = Utf8Chunker::default();
    loop {
        let chunk = tokio::select! {
            biased;
            chunk = output.recv() => chunk,
            () = close.closed() => None,
        };
        let Some(chunk) = chunk else {
            break;
        };
        if let Some(text) = chunker.push(&chunk)
            && let Err(e) = sink.send(Message::Text(text.into())).await
        {
            debug!(error = %e, "Terminal socket write failed");
            close.close();
            break;
        }
    }

    if let Some(rest) = chunker.finish()
        && let Err(e) = sink.send(Message::Text(rest.into())).await
    {
        debug!(error = %e, "Terminal socket final flush failed");
    }
    close.close();
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Terminal socket close failed");
    }
}
