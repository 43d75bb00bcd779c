//! Connection manager: owns the synthesis socket and its reconnect loop.
//!
//! ## Lifecycle
//!
//! ```text
//!   Disconnected ─connect()─▶ Connecting ─ok─▶ Open ─close/error─┐
//!                               ▲    └─fail─────────────────────┤
//!                               │                               ▼
//!                               └──── delay elapsed ──── WaitingToReconnect
//! ```
//!
//! Any close schedules exactly one new attempt after the configured fixed
//! delay, forever, until [`ConnectionManager::shutdown`] cancels the loop.
//! The delay never grows and carries no jitter.
//!
//! ## Cutover
//!
//! A socket carries at most one utterance request. A second request closes
//! the socket and is written as the first frame of a fresh one, opened right
//! away. Audio the backend still had in flight for the earlier request dies
//! with the old socket, so it can never be attributed to the new one. The
//! logical connection stays [`ConnectionState::Open`] throughout; only a
//! failed cutover is reported as a close.
//!
//! ## Output
//!
//! Everything the socket produces is reported as a [`ConnectionSignal`] on an
//! unbounded channel, in receipt order:
//! * binary frames become [`ConnectionSignal::Chunk`], tagged with the id of
//!   the request written to the same socket;
//! * text frames are parsed as JSON control messages, best effort;
//! * lifecycle changes become [`ConnectionSignal::Lifecycle`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::VoiceEngineConfig;
use crate::error::{ConnectionError, ProtocolError, VoiceError};
use crate::events::ConnectionEvent;
use crate::protocol::{ControlMessage, Frame, UtteranceRequest, parse_control};
use crate::session::SessionId;

// ── Transport seam ─────────────────────────────────────────────────

/// Write half of a socket.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ConnectionError> + Send>>;

/// Read half of a socket. Ends (or yields an error) when the socket closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ConnectionError>> + Send>>;

/// An open socket, split into its two halves.
pub struct Socket {
    pub outgoing: FrameSink,
    pub incoming: FrameStream,
}

/// Opens sockets to the synthesis backend.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Url) -> Result<Socket, ConnectionError>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Socket, ConnectionError> {
        let (ws, _response) =
            connect_async(endpoint.as_str())
                .await
                .map_err(|e| ConnectionError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;

        let (ws_sender, ws_receiver) = ws.split();

        let outgoing = ws_sender
            .sink_map_err(|e| ConnectionError::Io(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, ConnectionError>(frame_to_message(frame))));
        let incoming = ws_receiver.filter_map(|msg| future::ready(message_to_frame(msg)));

        Ok(Socket {
            outgoing: Box::pin(outgoing),
            incoming: Box::pin(incoming),
        })
    }
}

fn frame_to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
    }
}

fn message_to_frame(
    msg: Result<Message, tungstenite::Error>,
) -> Option<Result<Frame, ConnectionError>> {
    match msg {
        Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
        Ok(Message::Close(_)) => Some(Err(ConnectionError::Closed)),
        // Ping/pong are answered by tungstenite itself.
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(Err(ConnectionError::Io(e.to_string()))),
    }
}

// ── State and signals ──────────────────────────────────────────────

/// Lifecycle state of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect()` has not been called yet.
    Disconnected,
    /// An attempt is in progress.
    Connecting,
    /// The socket is open.
    Open,
    /// The socket closed; a new attempt is scheduled.
    WaitingToReconnect,
    /// The manager was shut down. Terminal.
    ShutDown,
}

/// Snapshot of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Last time a frame was read from or written to the socket.
    pub last_activity: Option<Instant>,
}

/// What the connection reports to its single consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    Lifecycle(ConnectionEvent),
    /// One binary frame. `request` is the id of the request written to the
    /// socket that delivered it, `None` if none was.
    Chunk {
        request: Option<SessionId>,
        chunk: Bytes,
    },
    /// One text frame, parsed.
    Control(Result<ControlMessage, ProtocolError>),
}

/// A request on its way to the socket task.
struct Outbound {
    id: SessionId,
    frame: Frame,
}

/// Shared between the manager and its socket task.
#[derive(Clone)]
struct Shared {
    status: Arc<watch::Sender<ConnectionStatus>>,
    signal_tx: mpsc::UnboundedSender<ConnectionSignal>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.state = state);
    }

    fn touch(&self) {
        self.status
            .send_modify(|status| status.last_activity = Some(Instant::now()));
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Best effort. If the consumer is gone there is nobody left to tell.
    fn emit(&self, signal: ConnectionSignal) {
        if self.signal_tx.send(signal).is_err() {
            tracing::debug!("Connection signal receiver dropped");
        }
    }

    fn lifecycle(&self, event: ConnectionEvent) {
        self.emit(ConnectionSignal::Lifecycle(event));
    }
}

// ── Manager ────────────────────────────────────────────────────────

/// Owns the socket task. Exactly one per engine.
pub struct ConnectionManager {
    endpoint: Url,
    reconnect_delay: Duration,
    connector: Arc<dyn Connector>,
    shared: Shared,
    outgoing_tx: Option<mpsc::UnboundedSender<Outbound>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until [`connect`](Self::connect).
    ///
    /// Returns the manager and the receiver for its [`ConnectionSignal`]s.
    pub fn new(
        config: &VoiceEngineConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionSignal>), VoiceError> {
        let endpoint = config.endpoint_url()?;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            last_activity: None,
        });

        let manager = Self {
            endpoint,
            reconnect_delay: config.reconnect_delay,
            connector,
            shared: Shared {
                status: Arc::new(status),
                signal_tx,
            },
            outgoing_tx: None,
            cancel: CancellationToken::new(),
            task: None,
        };

        Ok((manager, signal_rx))
    }

    /// Start the socket task. No-op while it is already running (connecting,
    /// open, or waiting to reconnect) and after shutdown.
    pub fn connect(&mut self) {
        if self.task.as_ref().is_some_and(|task| !task.is_finished())
            || self.cancel.is_cancelled()
        {
            return;
        }

        tracing::info!(endpoint = %self.endpoint, "Connecting voice socket");

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.outgoing_tx = Some(outgoing_tx);

        let socket_loop = SocketLoop {
            endpoint: self.endpoint.clone(),
            reconnect_delay: self.reconnect_delay,
            connector: Arc::clone(&self.connector),
            shared: self.shared.clone(),
            cancel: self.cancel.clone(),
        };
        self.task = Some(tokio::spawn(socket_loop.run(outgoing_rx)));
    }

    /// Queue a request for the open socket.
    ///
    /// When the socket is not open the request is dropped, a
    /// [`ConnectionEvent::SendRejected`] is reported and `false` is returned.
    pub fn send(&self, id: SessionId, request: &UtteranceRequest) -> bool {
        let frame = match request.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(request = %id, error = %e, "Utterance request not encodable");
                self.shared.lifecycle(ConnectionEvent::SendRejected);
                return false;
            }
        };

        let sent = self.is_open()
            && self
                .outgoing_tx
                .as_ref()
                .is_some_and(|tx| tx.send(Outbound { id, frame }).is_ok());

        if !sent {
            tracing::warn!(request = %id, "Voice socket not open, request dropped");
            self.shared.lifecycle(ConnectionEvent::SendRejected);
        }
        sent
    }

    pub fn is_open(&self) -> bool {
        self.shared.state() == ConnectionState::Open
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Cancel the socket task (including a pending reconnect) and wait for
    /// it to finish.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.outgoing_tx = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Voice socket task ended abnormally");
            }
        }
        self.shared.set_state(ConnectionState::ShutDown);
        tracing::info!("Voice socket shut down");
    }
}

#[cfg(test)]
impl ConnectionManager {
    /// Pretend the socket task reported `state`.
    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.shared.set_state(state);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Socket task ────────────────────────────────────────────────────

/// How one socket's pump loop ended.
enum PumpExit {
    Closed(ConnectionError),
    /// A second request arrived; it belongs on a fresh socket.
    Cutover(Outbound),
    Cancelled,
}

struct SocketLoop {
    endpoint: Url,
    reconnect_delay: Duration,
    connector: Arc<dyn Connector>,
    shared: Shared,
    cancel: CancellationToken,
}

impl SocketLoop {
    async fn run(self, mut outgoing_rx: mpsc::UnboundedReceiver<Outbound>) {
        // Request waiting for the socket a cutover is opening.
        let mut carried: Option<Outbound> = None;

        loop {
            if carried.is_none() {
                self.shared.set_state(ConnectionState::Connecting);
                self.shared.lifecycle(ConnectionEvent::Connecting);
            }

            let attempt = tokio::select! {
                () = self.cancel.cancelled() => break,
                attempt = self.connector.connect(&self.endpoint) => attempt,
            };

            let reason = match attempt {
                Ok(socket) => {
                    self.shared.touch();
                    if carried.is_none() {
                        self.shared.set_state(ConnectionState::Open);
                        self.shared.lifecycle(ConnectionEvent::Opened);
                        tracing::info!(endpoint = %self.endpoint, "Voice socket connected");
                    }

                    match self.pump(socket, carried.take(), &mut outgoing_rx).await {
                        PumpExit::Closed(reason) => reason,
                        PumpExit::Cutover(next) => {
                            tracing::debug!(request = %next.id, "Replacing voice socket for new utterance");
                            carried = Some(next);
                            continue;
                        }
                        PumpExit::Cancelled => break,
                    }
                }
                Err(reason) => {
                    if let Some(lost) = carried.take() {
                        tracing::warn!(request = %lost.id, "Cutover failed, request dropped");
                        self.shared.lifecycle(ConnectionEvent::SendRejected);
                    }
                    reason
                }
            };

            // Requests raced with the close; they must not leak onto the next socket.
            while outgoing_rx.try_recv().is_ok() {
                self.shared.lifecycle(ConnectionEvent::SendRejected);
            }

            self.shared.set_state(ConnectionState::WaitingToReconnect);
            self.shared.lifecycle(ConnectionEvent::Closed {
                reason: reason.clone(),
            });
            self.shared.lifecycle(ConnectionEvent::ReconnectScheduled {
                delay: self.reconnect_delay,
            });
            tracing::info!(
                reason = %reason,
                delay_ms = self.reconnect_delay.as_millis(),
                "Voice socket closed, reconnecting"
            );

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        self.shared.set_state(ConnectionState::ShutDown);
    }

    /// Shuttle frames until the socket closes, a cutover is due or the
    /// manager shuts down. `first` is written before anything else.
    async fn pump(
        &self,
        socket: Socket,
        first: Option<Outbound>,
        outgoing_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> PumpExit {
        let Socket {
            mut outgoing,
            mut incoming,
        } = socket;
        let mut request: Option<SessionId> = None;

        if let Some(Outbound { id, frame }) = first {
            if let Err(reason) = self.write(&mut outgoing, id, frame).await {
                return PumpExit::Closed(reason);
            }
            request = Some(id);
        }

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    close(&mut outgoing).await;
                    return PumpExit::Cancelled;
                }

                // Reading first: frames already buffered when a new request is
                // queued keep the previous request's tag.
                frame = incoming.next() => match frame {
                    Some(Ok(Frame::Binary(chunk))) => {
                        self.shared.touch();
                        self.shared.emit(ConnectionSignal::Chunk { request, chunk });
                    }
                    Some(Ok(Frame::Text(text))) => {
                        self.shared.touch();
                        self.shared.emit(ConnectionSignal::Control(parse_control(&text)));
                    }
                    Some(Err(reason)) => return PumpExit::Closed(reason),
                    None => return PumpExit::Closed(ConnectionError::Closed),
                },

                next = outgoing_rx.recv() => {
                    let Some(Outbound { id, frame }) = next else {
                        return PumpExit::Cancelled;
                    };
                    if request.is_some() {
                        close(&mut outgoing).await;
                        return PumpExit::Cutover(Outbound { id, frame });
                    }
                    if let Err(reason) = self.write(&mut outgoing, id, frame).await {
                        return PumpExit::Closed(reason);
                    }
                    request = Some(id);
                }
            }
        }
    }

    async fn write(
        &self,
        outgoing: &mut FrameSink,
        id: SessionId,
        frame: Frame,
    ) -> Result<(), ConnectionError> {
        outgoing.send(frame).await?;
        self.shared.touch();
        tracing::debug!(request = %id, "Utterance request sent");
        Ok(())
    }
}

/// Best effort; the socket is abandoned either way.
async fn close(outgoing: &mut FrameSink) {
    if let Err(e) = outgoing.close().await {
        tracing::debug!(error = %e, "Voice socket close failed");
    }
}
