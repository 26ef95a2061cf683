//! Terminal bridge between a client WebSocket and an exec-attach stream.
//!
//! The exec transport consumes three capabilities: a source of terminal
//! input, a sink for terminal output, and a source of resize events. A
//! [`TerminalBridge`] wraps one client connection and provides all three
//! as separate halves so input and output can run concurrently.
//!
//! ```text
//!  client ──frames──▶ BridgeInput ──bytes──▶ exec stdin
//!                         │
//!                         └─resize──▶ BridgeResize ──▶ exec resize queue
//!  client ◀──text──── BridgeOutput ◀──bytes── exec stdout
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ControlMessage, ProtocolError, ServerStatus, TerminalSize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::PodCluster;
use crate::lifecycle::PodLifecycle;

/// Resize requests buffered between the input reader and the exec stream.
const RESIZE_QUEUE_CAPACITY: usize = 8;

/// Errors raised while relaying terminal traffic.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The client connection failed.
    #[error("connection error: {0}")]
    Connection(#[from] WsError),

    /// A control message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Supplies terminal input to the exec stream.
pub trait TerminalInput: Send {
    /// Reads the next chunk of input into `buf`.
    ///
    /// Returns `Ok(0)` once the client has gone away.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize, BridgeError>> + Send;
}

/// Accepts terminal output from the exec stream.
pub trait TerminalOutput: Send {
    /// Forwards `buf` to the client, returning the number of bytes consumed.
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = Result<usize, BridgeError>> + Send;
}

/// Supplies terminal size changes to the exec stream.
pub trait TerminalResize: Send {
    /// Waits for the next size change. `None` means the session is over.
    fn next_size(&mut self) -> impl Future<Output = Option<TerminalSize>> + Send;
}

/// The capabilities handed to an exec-attach call.
pub struct TerminalStreams<I, O, R> {
    pub stdin: I,
    pub stdout: O,
    pub resize: R,
}

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// Reads client frames as terminal input.
///
/// Text frames holding a resize control message are diverted to the resize
/// queue; every other text or binary frame is input. A frame larger than
/// the caller's buffer is handed out over several reads.
pub struct BridgeInput<S> {
    stream: WsSource<S>,
    resize_tx: mpsc::Sender<TerminalSize>,
    pending: Vec<u8>,
}

impl<S> BridgeInput<S> {
    /// Moves as much buffered input as fits into `buf`.
    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }

    fn queue_resize(&self, size: TerminalSize) {
        if let Err(e) = self.resize_tx.try_send(size) {
            debug!(cols = size.cols, rows = size.rows, "Dropping resize request: {}", e);
        }
    }
}

impl<S> BridgeInput<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Holds on to client frames until the client goes away.
    ///
    /// Input is buffered for the first reads and resize requests are
    /// queued. Never returns while the connection is open, and is safe to
    /// drop between frames.
    async fn buffer_until_hangup(&mut self) -> Result<(), BridgeError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => match ControlMessage::parse(&text) {
                    Some(control) => self.queue_resize(control.terminal_size()),
                    None => self.pending.extend_from_slice(text.as_bytes()),
                },
                Some(Ok(WsMessage::Binary(data))) => self.pending.extend_from_slice(&data),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

impl<S> TerminalInput for BridgeInput<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BridgeError> {
        if !self.pending.is_empty() {
            return Ok(self.take_pending(buf));
        }

        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!("Error reading WebSocket message: {}", e);
                    return Err(e.into());
                }
                None => return Ok(0),
            };

            match message {
                WsMessage::Text(text) => {
                    if let Some(control) = ControlMessage::parse(&text) {
                        self.queue_resize(control.terminal_size());
                        continue;
                    }
                    if !text.is_empty() {
                        self.pending = text.into_bytes();
                        return Ok(self.take_pending(buf));
                    }
                }
                WsMessage::Binary(data) => {
                    if !data.is_empty() {
                        self.pending = data;
                        return Ok(self.take_pending(buf));
                    }
                }
                WsMessage::Close(_) => return Ok(0),
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
    }
}

/// Sends terminal output to the client as text frames.
pub struct BridgeOutput<S> {
    sink: WsSink<S>,
    decoder: Utf8Decoder,
}

impl<S> BridgeOutput<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Sends a status message as its own frame.
    pub async fn send_status(&mut self, status: &ServerStatus) -> Result<(), BridgeError> {
        self.sink.send(WsMessage::Text(status.to_json()?)).await?;
        Ok(())
    }
}

impl<S> TerminalOutput for BridgeOutput<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize, BridgeError> {
        let text = self.decoder.decode(buf);
        if !text.is_empty() {
            if let Err(e) = self.sink.send(WsMessage::Text(text)).await {
                warn!("Error writing WebSocket message: {}", e);
                return Err(e.into());
            }
        }
        Ok(buf.len())
    }
}

/// Turns a byte stream into text without splitting multi-byte characters.
///
/// An incomplete sequence at the end of a chunk is held back until the
/// next chunk; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let tail = rest.to_vec();
        self.pending = tail;
        out
    }
}

/// Delivers resize requests until the session is done.
pub struct BridgeResize {
    rx: mpsc::Receiver<TerminalSize>,
    done: CancellationToken,
}

impl TerminalResize for BridgeResize {
    async fn next_size(&mut self) -> Option<TerminalSize> {
        tokio::select! {
            biased;
            _ = self.done.cancelled() => None,
            size = self.rx.recv() => size,
        }
    }
}

/// Ends a bridged session: signals done and deletes the pod, once.
pub struct BridgeCloser<C> {
    inner: Arc<CloserInner<C>>,
}

struct CloserInner<C> {
    pod_name: String,
    closed: AtomicBool,
    done: CancellationToken,
    lifecycle: Arc<PodLifecycle<C>>,
}

impl<C> Clone for BridgeCloser<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: PodCluster> BridgeCloser<C> {
    /// Closes the bridge.
    ///
    /// Only the first call has an effect: it fires the done signal and
    /// deletes the pod. Returns true for that call and false afterwards.
    pub async fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(pod = %self.inner.pod_name, "Bridge already closed");
            return false;
        }

        self.inner.done.cancel();
        self.inner.lifecycle.delete_safe(&self.inner.pod_name).await;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the bridge closes.
    pub fn done(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    pub fn pod_name(&self) -> &str {
        &self.inner.pod_name
    }
}

/// One client connection adapted to the exec transport's stream contract.
pub struct TerminalBridge<S, C> {
    input: BridgeInput<S>,
    output: BridgeOutput<S>,
    resize: BridgeResize,
    closer: BridgeCloser<C>,
}

impl<S, C> TerminalBridge<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: PodCluster,
{
    /// Wraps `ws` for the session owning `pod_name`.
    pub fn new(
        ws: WebSocketStream<S>,
        pod_name: impl Into<String>,
        lifecycle: Arc<PodLifecycle<C>>,
    ) -> Self {
        let (sink, stream) = ws.split();
        let (resize_tx, resize_rx) = mpsc::channel(RESIZE_QUEUE_CAPACITY);
        let done = CancellationToken::new();

        Self {
            input: BridgeInput {
                stream,
                resize_tx,
                pending: Vec::new(),
            },
            output: BridgeOutput {
                sink,
                decoder: Utf8Decoder::default(),
            },
            resize: BridgeResize {
                rx: resize_rx,
                done: done.clone(),
            },
            closer: BridgeCloser {
                inner: Arc::new(CloserInner {
                    pod_name: pod_name.into(),
                    closed: AtomicBool::new(false),
                    done,
                    lifecycle,
                }),
            },
        }
    }

    /// Resolves when the client disconnects before the shell is attached.
    ///
    /// Frames that arrive meanwhile are kept for the exec stream.
    pub async fn wait_for_hangup(&mut self) -> Result<(), BridgeError> {
        self.input.buffer_until_hangup().await
    }

    /// Tells the client the shell is about to be attached.
    pub async fn notify_ready(&mut self) -> Result<(), BridgeError> {
        self.output.send_status(&ServerStatus::ready()).await
    }

    /// Returns a handle that can close the bridge from anywhere.
    pub fn closer(&self) -> BridgeCloser<C> {
        self.closer.clone()
    }

    /// Splits the bridge into the stream bundle for the exec transport and
    /// its closer.
    pub fn into_streams(
        self,
    ) -> (
        TerminalStreams<BridgeInput<S>, BridgeOutput<S>, BridgeResize>,
        BridgeCloser<C>,
    ) {
        (
            TerminalStreams {
                stdin: self.input,
                stdout: self.output,
                resize: self.resize,
            },
            self.closer,
        )
    }
}
