//! `SpeakController`, the public face of the voice engine.
//!
//! One owner task holds every piece of mutable state: the connection
//! manager, the current [`PlaybackSession`] and the session counter. The
//! [`SpeakController`] handle only sends it commands over a channel and waits
//! for the reply, so `speak()`, chunk arrival, append completion and socket
//! close are processed strictly one after another and never interleave.
//!
//! ```text
//!   SpeakController ──Command──▶ ┌────────────┐ ◀──ConnectionSignal── socket task
//!                                │ owner task │
//!   EngineEvent ◀────────────────┤            │ ◀──AppendCompletion── sink
//!                                └────────────┘
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::audio_io::SinkFactory;
use crate::config::VoiceEngineConfig;
use crate::connection::{ConnectionManager, ConnectionSignal, ConnectionStatus, Connector};
use crate::error::{SinkError, VoiceError};
use crate::events::{ConnectionEvent, DiscardReason, EngineEvent};
use crate::protocol::{ControlMessage, UtteranceRequest};
use crate::session::{AppendOutcome, PlaybackSession, SessionId, SessionState};

/// Snapshot returned by [`SpeakController::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub connection: ConnectionStatus,
    /// The current session, if any utterance has been started.
    pub session: Option<SessionSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    /// Chunks waiting behind the in-flight append.
    pub queued: usize,
    pub playing: bool,
}

enum Command {
    Speak {
        text: String,
        reply: oneshot::Sender<Option<SessionId>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running voice engine.
#[derive(Debug, Clone)]
pub struct SpeakController {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl SpeakController {
    /// Start an engine on the current tokio runtime and begin connecting.
    ///
    /// Returns the handle and the receiver for the engine's events. The
    /// receiver may be dropped; events are then discarded.
    pub fn spawn(
        config: &VoiceEngineConfig,
        connector: Arc<dyn Connector>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>), VoiceError> {
        let (mut connection, signals) = ConnectionManager::new(config, connector)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        connection.connect();

        let engine = Engine::new(connection, sinks, event_tx);
        tokio::spawn(engine.run(cmd_rx, signals));

        Ok((Self { cmd_tx }, event_rx))
    }

    /// Speak `text`, replacing whatever is currently playing.
    ///
    /// When this returns the previous session is already superseded: none of
    /// its remaining audio will reach a sink. Returns the new session's id,
    /// or `None` when the utterance was ignored (blank text, socket not open,
    /// no sink available).
    pub async fn speak(&self, text: impl Into<String>) -> Result<Option<SessionId>, VoiceError> {
        let text = text.into();
        self.send_and_recv(|reply| Command::Speak { text, reply })
            .await
    }

    /// Pause the current session. Safe to call any number of times.
    pub async fn stop(&self) -> Result<(), VoiceError> {
        self.send_and_recv(|reply| Command::Stop { reply }).await
    }

    pub async fn state(&self) -> Result<EngineSnapshot, VoiceError> {
        self.send_and_recv(|reply| Command::State { reply }).await
    }

    /// Stop the engine: cancel any pending reconnect, close the socket and
    /// release the current sink. Idempotent.
    pub async fn shutdown(&self) -> Result<(), VoiceError> {
        match self.send_and_recv(|reply| Command::Shutdown { reply }).await {
            Ok(()) | Err(VoiceError::EngineStopped) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_and_recv<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, VoiceError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| VoiceError::EngineStopped)?;
        rx.await.map_err(|_| VoiceError::EngineStopped)
    }
}

// ── Owner task ─────────────────────────────────────────────────────

struct EventEmitter {
    tx: mpsc::UnboundedSender<EngineEvent>,
    closed: bool,
}

impl EventEmitter {
    fn emit(&mut self, event: EngineEvent) {
        if self.tx.send(event).is_err() && !self.closed {
            self.closed = true;
            tracing::warn!("Engine event receiver dropped, events are discarded");
        }
    }
}

struct Engine {
    connection: ConnectionManager,
    sinks: Arc<dyn SinkFactory>,
    current: Option<PlaybackSession>,
    next_id: SessionId,
    events: EventEmitter,
}

impl Engine {
    fn new(
        connection: ConnectionManager,
        sinks: Arc<dyn SinkFactory>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            connection,
            sinks,
            current: None,
            next_id: SessionId::new(1),
            events: EventEmitter {
                tx: events,
                closed: false,
            },
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    ) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle(command).await,
                        // Every handle is gone.
                        None => {
                            self.shutdown().await;
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }

                Some(signal) = signals.recv() => self.on_signal(signal),

                result = next_append(&mut self.current) => self.on_append_complete(result),
            }

            self.pump();
        }

        tracing::debug!("Voice engine stopped");
    }

    /// Returns `false` once the engine should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Speak { text, reply } => {
                let id = self.speak(&text);
                let _ = reply.send(id);
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::State { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn speak(&mut self, text: &str) -> Option<SessionId> {
        if text.trim().is_empty() {
            tracing::debug!("Ignoring blank utterance");
            return None;
        }

        self.connection.connect();
        if !self.connection.is_open() {
            tracing::warn!("Voice socket not open, utterance ignored");
            self.events.emit(EngineEvent::NotConnected);
            return None;
        }

        self.supersede_current();

        let id = self.next_id;
        self.next_id = id.next();

        let sink = match self.sinks.create() {
            Ok(sink) => sink,
            Err(error) => {
                tracing::warn!(session = %id, error = %error, "No audio sink for utterance");
                self.events.emit(EngineEvent::SinkUnavailable { error });
                return None;
            }
        };

        // The socket may have closed since the check above.
        if !self.connection.send(id, &UtteranceRequest::new(text)) {
            tracing::warn!(session = %id, "Utterance request not sent, session dropped");
            return None;
        }

        self.current = Some(PlaybackSession::new(id, sink));
        tracing::debug!(session = %id, chars = text.len(), "Session created");
        self.emit_state(id, SessionState::Idle);
        Some(id)
    }

    /// Hard cutover: nothing the old session still holds reaches a sink.
    fn supersede_current(&mut self) {
        let Some(mut old) = self.current.take() else {
            return;
        };
        let id = old.id();
        let (dropped, in_flight) = old.supersede();

        self.emit_state(id, SessionState::Superseded);
        for chunk in dropped {
            self.discard(Some(id), chunk.len(), DiscardReason::Superseded);
        }

        // The sink is gone; its last append may still finish on its own.
        if let Some(completion) = in_flight {
            tokio::spawn(async move {
                if let Err(e) = completion.await {
                    tracing::debug!(session = %id, error = %e, "Detached append failed");
                }
            });
        }
    }

    fn stop(&mut self) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        let id = session.id();
        if let Some(state) = session.stop() {
            self.emit_state(id, state);
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            connection: self.connection.status(),
            session: self.current.as_ref().map(|session| SessionSnapshot {
                id: session.id(),
                state: session.state(),
                queued: session.queued(),
                playing: session.is_playing(),
            }),
        }
    }

    fn on_signal(&mut self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Lifecycle(event) => {
                let closed = matches!(event, ConnectionEvent::Closed { .. });
                self.events.emit(EngineEvent::Connection(event));

                if closed {
                    if let Some(session) = self.current.as_mut() {
                        let id = session.id();
                        if let Some(state) = session.connection_lost() {
                            self.emit_state(id, state);
                        }
                    }
                }
            }
            ConnectionSignal::Chunk { request, chunk } => self.on_chunk(request, chunk),
            ConnectionSignal::Control(Ok(ControlMessage::Error { message })) => {
                tracing::error!(message = %message, "Synthesis backend reported an error");
                self.events.emit(EngineEvent::ServerError { message });
            }
            ConnectionSignal::Control(Ok(ControlMessage::Unrecognized)) => {
                tracing::debug!("Ignoring unrecognized control message");
            }
            ConnectionSignal::Control(Err(error)) => {
                tracing::warn!(error = %error, "Ignoring malformed control message");
                self.events.emit(EngineEvent::ProtocolError { error });
            }
        }
    }

    fn on_chunk(&mut self, request: Option<SessionId>, chunk: Bytes) {
        let bytes = chunk.len();
        let Some(request) = request else {
            self.discard(None, bytes, DiscardReason::NoSession);
            return;
        };

        match self.current.as_mut() {
            Some(session) if session.id() == request => {
                if let Err(reason) = session.accept(chunk) {
                    self.discard(Some(request), bytes, reason);
                }
            }
            Some(_) => self.discard(Some(request), bytes, DiscardReason::Stale),
            None => self.discard(Some(request), bytes, DiscardReason::NoSession),
        }
    }

    fn on_append_complete(&mut self, result: Result<(), SinkError>) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        let id = session.id();

        match session.on_append_complete(result) {
            AppendOutcome::Appended { bytes, playback } => {
                self.events.emit(EngineEvent::ChunkAppended { session: id, bytes });
                match playback {
                    Some(Ok(())) => {
                        tracing::debug!(session = %id, "Playback started");
                        self.events.emit(EngineEvent::PlaybackStarted { session: id });
                    }
                    Some(Err(error)) => {
                        tracing::warn!(session = %id, error = %error, "Sink refused to play");
                        self.events
                            .emit(EngineEvent::PlaybackRejected { session: id, error });
                    }
                    None => {}
                }
            }
            AppendOutcome::Rejected { error, .. } => {
                self.events
                    .emit(EngineEvent::DecodeFailed { session: id, error });
            }
        }
    }

    fn pump(&mut self) {
        let Some(session) = self.current.as_mut() else {
            return;
        };
        let id = session.id();
        if let Some(state) = session.pump() {
            self.emit_state(id, state);
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut session) = self.current.take() {
            let (dropped, _in_flight) = session.release();
            tracing::debug!(session = %session.id(), dropped = dropped.len(), "Session released");
        }
        self.connection.shutdown().await;
    }

    fn emit_state(&mut self, session: SessionId, state: SessionState) {
        tracing::debug!(session = %session, state = ?state, "Session state changed");
        self.events.emit(EngineEvent::SessionState { session, state });
    }

    fn discard(&mut self, session: Option<SessionId>, bytes: usize, reason: DiscardReason) {
        tracing::warn!(session = ?session, bytes, reason = %reason, "Chunk discarded");
        self.events.emit(EngineEvent::ChunkDiscarded {
            session,
            bytes,
            reason,
        });
    }
}

/// The current session's in-flight append, or pending forever.
async fn next_append(current: &mut Option<PlaybackSession>) -> Result<(), SinkError> {
    match current {
        Some(session) => session.next_append().await,
        None => std::future::pending().await,
    }
}
