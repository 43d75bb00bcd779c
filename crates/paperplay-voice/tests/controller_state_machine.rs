//! Integration tests for the `SpeakController` engine.
//!
//! These tests drive the full engine (owner task, connection task, session
//! state machine) against an in-memory socket and a scripted audio sink. No
//! network access or audio hardware is required.
//!
//! # What is tested
//!
//! - Chunks are appended in arrival order, one at a time, and playback starts
//!   after the first completed append
//! - A new utterance supersedes the old one without any cross-talk
//! - `stop()` is idempotent and stopped sessions never auto-play
//! - Rejected chunks and malformed control frames do not stall the stream
//! - Connection loss, the fixed reconnect delay and its cancellation
//! - `speak()` while disconnected, with blank text, and after shutdown

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{sink, stream};
use paperplay_voice::{
    AppendCompletion, ConnectionError, ConnectionEvent, ConnectionState, Connector,
    DiscardReason, EngineEvent, Frame, SessionId, SessionState, SinkError, SinkFactory, Socket,
    SpeakController, StreamingAudioSink, VoiceEngineConfig, VoiceError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout};
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

// ── Mock backend ───────────────────────────────────────────────────

struct ServerSide {
    to_client: mpsc::UnboundedSender<Result<Frame, ConnectionError>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

#[derive(Default)]
struct BackendState {
    attempts: usize,
    refuse: bool,
    sockets: Vec<ServerSide>,
}

/// In-memory synthesis backend. Every connection attempt opens a new socket
/// the test can push frames into.
#[derive(Clone, Default)]
struct MockBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    fn refusing() -> Self {
        let backend = Self::default();
        backend.state.lock().unwrap().refuse = true;
        backend
    }

    fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    fn push(&self, frame: Frame) {
        let state = self.state.lock().unwrap();
        let socket = state.sockets.last().expect("no open socket");
        socket.to_client.send(Ok(frame)).unwrap();
    }

    /// Push a frame on socket `index`. Returns `false` once the client has
    /// let go of that socket.
    fn push_to(&self, index: usize, frame: Frame) -> bool {
        let state = self.state.lock().unwrap();
        state.sockets[index].to_client.send(Ok(frame)).is_ok()
    }

    fn push_audio(&self, chunk: &'static [u8]) {
        self.push(Frame::Binary(Bytes::from_static(chunk)));
    }

    fn push_text(&self, text: &str) {
        self.push(Frame::Text(text.to_string()));
    }

    /// Server closes every open socket.
    fn drop_sockets(&self) {
        self.state.lock().unwrap().sockets.clear();
    }

    /// Wait for the next utterance request on the newest socket.
    async fn next_request(&self) -> serde_json::Value {
        let found = timeout(WAIT, async {
            loop {
                let frame = {
                    let mut state = self.state.lock().unwrap();
                    state
                        .sockets
                        .last_mut()
                        .and_then(|socket| socket.from_client.try_recv().ok())
                };
                if let Some(Frame::Text(text)) = frame {
                    return serde_json::from_str(&text).unwrap();
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        found.expect("timed out waiting for a request")
    }

    fn pending_requests(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for socket in &mut state.sockets {
            while socket.from_client.try_recv().is_ok() {
                count += 1;
            }
        }
        count
    }
}

#[async_trait]
impl Connector for MockBackend {
    async fn connect(&self, endpoint: &Url) -> Result<Socket, ConnectionError> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if state.refuse {
            return Err(ConnectionError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        state.sockets.push(ServerSide {
            to_client,
            from_client,
        });

        let outgoing = sink::unfold(client_tx, |tx, frame: Frame| async move {
            tx.send(frame).map_err(|_| ConnectionError::Closed)?;
            Ok::<_, ConnectionError>(tx)
        });
        let incoming = stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Socket {
            outgoing: Box::pin(outgoing),
            incoming: Box::pin(incoming),
        })
    }
}

// ── Scripted sink ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum SinkOp {
    Append(usize, Bytes),
    Play(usize),
    Pause(usize),
}

#[derive(Default)]
struct ProbeState {
    created: AtomicUsize,
    ops: Mutex<Vec<SinkOp>>,
    held: Mutex<VecDeque<oneshot::Sender<Result<(), SinkError>>>>,
}

/// Sink factory recording every operation. With `manual` completions each
/// append stays in flight until the test calls [`SinkProbe::complete_next`].
#[derive(Clone, Default)]
struct SinkProbe {
    state: Arc<ProbeState>,
    manual: bool,
    reject: Option<Bytes>,
}

impl SinkProbe {
    fn manual() -> Self {
        Self {
            manual: true,
            ..Self::default()
        }
    }

    fn rejecting(chunk: &'static [u8]) -> Self {
        Self {
            reject: Some(Bytes::from_static(chunk)),
            ..Self::default()
        }
    }

    fn ops(&self) -> Vec<SinkOp> {
        self.state.ops.lock().unwrap().clone()
    }

    fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    fn complete_next(&self, result: Result<(), SinkError>) {
        let held = self.state.held.lock().unwrap().pop_front();
        // The receiver is gone if its sink was already released.
        let _ = held.expect("no append in flight").send(result);
    }

    /// Wait until the sink log satisfies `pred`.
    async fn wait_for_ops(&self, pred: impl Fn(&[SinkOp]) -> bool) {
        let reached = timeout(WAIT, async {
            while !pred(&self.ops()) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out; sink log {:?}", self.ops());
    }
}

struct ProbeSink {
    id: usize,
    probe: SinkProbe,
}

impl ProbeSink {
    fn record(&self, op: SinkOp) {
        self.probe.state.ops.lock().unwrap().push(op);
    }
}

impl StreamingAudioSink for ProbeSink {
    fn is_ready(&self) -> bool {
        true
    }

    fn append(&mut self, chunk: Bytes) -> AppendCompletion {
        self.record(SinkOp::Append(self.id, chunk.clone()));
        if self.probe.reject.as_ref() == Some(&chunk) {
            return Box::pin(async { Err(SinkError::Decode("bad frame".to_string())) });
        }
        if self.probe.manual {
            let (tx, rx) = oneshot::channel();
            self.probe.state.held.lock().unwrap().push_back(tx);
            return Box::pin(async move { rx.await.unwrap_or(Err(SinkError::Closed)) });
        }
        Box::pin(async { Ok(()) })
    }

    fn play(&mut self) -> Result<(), SinkError> {
        self.record(SinkOp::Play(self.id));
        Ok(())
    }

    fn pause(&mut self) {
        self.record(SinkOp::Pause(self.id));
    }
}

impl SinkFactory for SinkProbe {
    fn create(&self) -> Result<Box<dyn StreamingAudioSink>, SinkError> {
        let id = self.state.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(ProbeSink {
            id,
            probe: self.clone(),
        }))
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn config() -> VoiceEngineConfig {
    VoiceEngineConfig::with_endpoint("ws://voice.test/api/v1/voice/stream")
}

fn start(
    backend: &MockBackend,
    sinks: &SinkProbe,
) -> (SpeakController, mpsc::UnboundedReceiver<EngineEvent>) {
    SpeakController::spawn(&config(), Arc::new(backend.clone()), Arc::new(sinks.clone())).unwrap()
}

/// Start an engine and wait until its socket is open.
async fn start_open(
    backend: &MockBackend,
    sinks: &SinkProbe,
) -> (SpeakController, mpsc::UnboundedReceiver<EngineEvent>) {
    let (voice, mut rx) = start(backend, sinks);
    events_until(&mut rx, |e| {
        *e == EngineEvent::Connection(ConnectionEvent::Opened)
    })
    .await;
    (voice, rx)
}

/// Receive events up to and including the first one matching `pred`.
async fn events_until(
    rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    let found = timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            let done = pred(&event);
            seen.push(event);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "event never arrived; saw {seen:?}");
    seen
}

/// Drain all pending events from the event receiver and return them.
fn drain_events(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

fn state_event(session: u64, state: SessionState) -> EngineEvent {
    EngineEvent::SessionState {
        session: SessionId::new(session),
        state,
    }
}

fn chunk(data: &'static [u8]) -> Bytes {
    Bytes::from_static(data)
}

/// Wait until the current session has `n` chunks queued behind its in-flight one.
async fn wait_for_queued(voice: &SpeakController, n: usize) {
    let reached = timeout(WAIT, async {
        loop {
            let snapshot = voice.state().await.unwrap();
            if snapshot.session.is_some_and(|s| s.queued == n) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "queue never reached {n} chunks");
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn chunks_play_in_order_after_first_append() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::default();
    let (voice, mut rx) = start_open(&backend, &sinks).await;

    let id = voice.speak("Hello there").await.unwrap();
    assert_eq!(id, Some(SessionId::new(1)));
    assert_eq!(
        backend.next_request().await,
        serde_json::json!({ "text": "Hello there" })
    );

    backend.push_audio(b"AAAA");
    backend.push_audio(b"BB");
    backend.push_audio(b"C");

    let events = events_until(&mut rx, |e| {
        matches!(e, EngineEvent::ChunkAppended { bytes: 1, .. })
    })
    .await;

    let appended: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::ChunkAppended { bytes, .. } => Some(*bytes),
            _ => None,
        })
        .collect();
    assert_eq!(appended, vec![4, 2, 1]);
    assert!(events.contains(&state_event(1, SessionState::Streaming)));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, EngineEvent::PlaybackStarted { .. }))
            .count(),
        1
    );

    assert_eq!(
        sinks.ops(),
        vec![
            SinkOp::Append(1, chunk(b"AAAA")),
            SinkOp::Play(1),
            SinkOp::Append(1, chunk(b"BB")),
            SinkOp::Append(1, chunk(b"C")),
        ]
    );
}

#[tokio::test]
async fn only_one_append_is_in_flight() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::manual();
    let (voice, mut rx) = start_open(&backend, &sinks).await;

    voice.speak("Hi").await.unwrap();
    backend.next_request().await;
    backend.push_audio(b"A");
    backend.push_audio(b"B");

    events_until(&mut rx, |e| *e == state_event(1, SessionState::Streaming)).await;
    wait_for_queued(&voice, 1).await;
    assert_eq!(sinks.ops(), vec![SinkOp::Append(1, chunk(b"A"))]);

    sinks.complete_next(Ok(()));
    events_until(&mut rx, |e| {
        matches!(e, EngineEvent::PlaybackStarted { .. })
    })
    .await;
    sinks
        .wait_for_ops(|ops| ops.contains(&SinkOp::Append(1, chunk(b"B"))))
        .await;

    assert_eq!(
        sinks.ops(),
        vec![
            SinkOp::Append(1, chunk(b"A")),
            SinkOp::Play(1),
            SinkOp::Append(1, chunk(b"B")),
        ]
    );
}

#[tokio::test]
async fn new_utterance_supersedes_without_cross_talk() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::manual();
    let (voice, mut rx) = start_open(&backend, &sinks).await;

    voice.speak("Hi").await.unwrap();
    backend.next_request().await;
    backend.push_audio(b"A");
    backend.push_audio(b"B");
    events_until(&mut rx, |e| *e == state_event(1, SessionState::Streaming)).await;
    wait_for_queued(&voice, 1).await;

    // A is mid-append on Hi's sink, B is queued behind it.
    let bye = voice.speak("Bye").await.unwrap();
    assert_eq!(bye, Some(SessionId::new(2)));

    let events = drain_events(&mut rx);
    assert!(events.contains(&state_event(1, SessionState::Superseded)));
    assert!(events.contains(&EngineEvent::ChunkDiscarded {
        session: Some(SessionId::new(1)),
        bytes: 1,
        reason: DiscardReason::Superseded,
    }));
    assert!(events.contains(&state_event(2, SessionState::Idle)));

    assert_eq!(
        backend.next_request().await,
        serde_json::json!({ "text": "Bye" })
    );
    backend.push_audio(b"CC");
    events_until(&mut rx, |e| *e == state_event(2, SessionState::Streaming)).await;

    // A's append finishing late changes nothing for Bye.
    sinks.complete_next(Ok(()));
    sinks.complete_next(Ok(()));
    events_until(&mut rx, |e| {
        *e == EngineEvent::PlaybackStarted {
            session: SessionId::new(2),
        }
    })
    .await;

    assert_eq!(
        sinks.ops(),
        vec![
            SinkOp::Append(1, chunk(b"A")),
            SinkOp::Pause(1),
            SinkOp::Append(2, chunk(b"CC")),
            SinkOp::Play(2),
        ]
    );
}

#[tokio::test]
async fn audio_in_flight_for_old_utterance_never_reaches_new_sink() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::default();
    let (voice, mut rx) = start_open(&backend, &sinks).await;

    voice.speak("Hi").await.unwrap();
    backend.next_request().await;
    backend.push_audio(b"A-hi");
    events_until(&mut rx, |e| {
        matches!(e, EngineEvent::ChunkAppended { .. })
    })
    .await;

    voice.speak("Bye").await.unwrap();
    assert_eq!(
        backend.next_request().await,
        serde_json::json!({ "text": "Bye" })
    );

    // The backend reads "Bye" while still streaming "Hi" on the first socket.
    assert!(!backend.push_to(0, Frame::Binary(chunk(b"B-hi"))));
    backend.push_audio(b"C-bye");

    let mut events = events_until(&mut rx, |e| {
        *e == EngineEvent::ChunkAppended {
            session: SessionId::new(2),
            bytes: 5,
        }
    })
    .await;

    assert_eq!(
        sinks.ops(),
        vec![
            SinkOp::Append(1, chunk(b"A-hi")),
            SinkOp::Play(1),
            SinkOp::Pause(1),
            SinkOp::Append(2, chunk(b"C-bye")),
            SinkOp::Play(2),
        ]
    );
    // Replacing the socket is not a connection loss.
    events.extend(drain_events(&mut rx));
    assert_eq!(backend.attempts(), 2);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, EngineEvent::Connection(ConnectionEvent::Closed { .. })))
    );
}

#[tokio::test]
async fn audio_before_any_request_is_discarded() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::default();
    let (_voice, mut rx) = start_open(&backend, &sinks).await;

    backend.push_audio(b"stray");

    let events = events_until(&mut rx, |e| {
        matches!(e, EngineEvent::ChunkDiscarded { .. })
    })
    .await;
    assert_eq!(
        events.last(),
        Some(&EngineEvent::ChunkDiscarded {
            session: None,
            bytes: 5,
            reason: DiscardReason::NoSession,
        })
    );
    assert!(sinks.ops().is_empty());
}

#[tokio::test]
async fn stop_is_idempotent_and_blocks_auto_play() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::default();
    let (voice, mut rx) = start_open(&backend, &sinks).await;

    voice.speak("Hi").await.unwrap();
    backend.next_request().await;

    voice.stop().await.unwrap();
    voice.stop().await.unwrap();
    voice.stop().await.unwrap();

    let stopped = drain_events(&mut rx)
        .into_iter()
        .filter(|e| *e == state_event(1, SessionState::Stopped))
        .count();
    assert_eq!(stopped, 1);

    // Audio keeps buffering into the stopped session, output stays paused.
    backend.push_audio(b"A");
    events_until(&mut rx, |e| {
        matches!(e, EngineEvent::ChunkAppended { .. })
    })
    .await;

    assert_eq!(
        sinks.ops(),
        vec![
            SinkOp::Pause(1),
            SinkOp::Pause(1),
            SinkOp::Pause(1),
            SinkOp::Append(1, chunk(b"A")),
        ]
    );
    let snapshot = voice.state().await.unwrap();
    let session = snapshot.session.unwrap();
    assert_eq!(session.state, SessionState::Stopped);
    assert!(!session.playing);
}

#[tokio::test]
async fn stop_without_session_does_nothing() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::default();
    let (voice, mut rx) = start_open(&backend, &sinks).await;

    voice.stop().await.unwrap();
    voice.stop().await.unwrap();

    assert!(drain_events(&mut rx).is_empty());
    assert_eq!(sinks.created(), 0);
}

#[tokio::test]
async fn rejected_chunk_is_skipped() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::rejecting(b"garbage");
    let (voice, mut rx) = start_open(&backend, &sinks).await;

    voice.speak("Hi").await.unwrap();
    backend.next_request().await;
    backend.push_audio(b"garbage");
    backend.push_audio(b"good");

    let events = events_until(&mut rx, |e| {
        matches!(e, EngineEvent::PlaybackStarted { .. })
    })
    .await;

    assert!(events.contains(&EngineEvent::DecodeFailed {
        session: SessionId::new(1),
        error: SinkError::Decode("bad frame".to_string()),
    }));
    assert!(events.contains(&EngineEvent::ChunkAppended {
        session: SessionId::new(1),
        bytes: 4,
    }));
    assert_eq!(
        sinks.ops(),
        vec![
            SinkOp::Append(1, chunk(b"garbage")),
            SinkOp::Append(1, chunk(b"good")),
            SinkOp::Play(1),
        ]
    );
}

#[tokio::test]
async fn control_frames_are_reported_not_fatal() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::default();
    let (voice, mut rx) = start_open(&backend, &sinks).await;

    voice.speak("Hi").await.unwrap();
    backend.next_request().await;

    backend.push_text("not json");
    backend.push_text(r#"{"type":"error","error":"voice model unavailable"}"#);
    backend.push_text(r#"{"type":"progress"}"#);
    backend.push_audio(b"A");

    let events = events_until(&mut rx, |e| {
        matches!(e, EngineEvent::ChunkAppended { .. })
    })
    .await;

    assert!(events.iter().any(|e| matches!(e, EngineEvent::ProtocolError { .. })));
    assert!(events.contains(&EngineEvent::ServerError {
        message: "voice model unavailable".to_string(),
    }));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, EngineEvent::Connection(ConnectionEvent::Closed { .. })))
    );
    assert_eq!(
        voice.state().await.unwrap().connection.state,
        ConnectionState::Open
    );
}

#[tokio::test]
async fn blank_text_is_ignored() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::default();
    let (voice, mut rx) = start_open(&backend, &sinks).await;

    assert_eq!(voice.speak("   \n").await.unwrap(), None);

    assert!(drain_events(&mut rx).is_empty());
    assert_eq!(backend.pending_requests(), 0);
    assert_eq!(sinks.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn speak_while_disconnected_is_ignored() {
    let backend = MockBackend::refusing();
    let sinks = SinkProbe::default();
    let (voice, mut rx) = start(&backend, &sinks);

    events_until(&mut rx, |e| {
        matches!(e, EngineEvent::Connection(ConnectionEvent::Closed { .. }))
    })
    .await;

    assert_eq!(voice.speak("anyone there?").await.unwrap(), None);
    events_until(&mut rx, |e| *e == EngineEvent::NotConnected).await;
    assert_eq!(sinks.created(), 0);
    assert!(voice.state().await.unwrap().session.is_none());
}

#[tokio::test(start_paused = true)]
async fn connection_loss_reconnects_after_fixed_delay() {
    let backend = MockBackend::default();
    let sinks = SinkProbe::default();
    let (voice, mut rx) = start_open(&backend, &sinks).await;

    voice.speak("Hi").await.unwrap();
    backend.next_request().await;
    backend.push_audio(b"A");
    events_until(&mut rx, |e| {
        matches!(e, EngineEvent::ChunkAppended { .. })
    })
    .await;

    backend.drop_sockets();
    let events = events_until(&mut rx, |e| {
        matches!(
            e,
            EngineEvent::Connection(ConnectionEvent::ReconnectScheduled { .. })
        )
    })
    .await;
    let closed_at = Instant::now();
    assert!(events.contains(&state_event(1, SessionState::ConnectionLost)));
    assert_eq!(
        events.last(),
        Some(&EngineEvent::Connection(
            ConnectionEvent::ReconnectScheduled {
                delay: Duration::from_millis(2000)
            }
        ))
    );

    events_until(&mut rx, |e| {
        *e == EngineEvent::Connection(ConnectionEvent::Connecting)
    })
    .await;
    assert!(closed_at.elapsed() >= Duration::from_millis(2000));
    events_until(&mut rx, |e| {
        *e == EngineEvent::Connection(ConnectionEvent::Opened)
    })
    .await;
    assert_eq!(backend.attempts(), 2);

    // The engine is usable again on the new socket.
    assert_eq!(
        voice.speak("again").await.unwrap(),
        Some(SessionId::new(2))
    );
    assert_eq!(
        backend.next_request().await,
        serde_json::json!({ "text": "again" })
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_reconnect() {
    let backend = MockBackend::refusing();
    let sinks = SinkProbe::default();
    let (voice, mut rx) = start(&backend, &sinks);

    events_until(&mut rx, |e| {
        matches!(
            e,
            EngineEvent::Connection(ConnectionEvent::ReconnectScheduled { .. })
        )
    })
    .await;

    voice.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(backend.attempts(), 1);
    assert!(matches!(
        voice.speak("too late").await,
        Err(VoiceError::EngineStopped)
    ));
    assert!(matches!(voice.stop().await, Err(VoiceError::EngineStopped)));
    voice.shutdown().await.unwrap();
}
