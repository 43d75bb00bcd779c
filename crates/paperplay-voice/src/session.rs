//! Playback session: the lifecycle of one utterance's audio.
//!
//! ```text
//!   Idle ──first delivery──▶ Streaming
//!    │                          │
//!    ├──────────────────────────┼──▶ Superseded   (speak() again; terminal)
//!    ├──────────────────────────┼──▶ Stopped      (stop(); sink paused, kept)
//!    └──────────────────────────┴──▶ ConnectionLost (socket closed)
//! ```
//!
//! There is no "completed" state: the protocol has no end-of-utterance
//! marker, so a session streams until something else ends it.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::audio_io::{AppendCompletion, StreamingAudioSink};
use crate::error::SinkError;
use crate::events::DiscardReason;
use crate::queue::ChunkQueue;

/// Identity of an utterance. Doubles as the request sequence number, so it
/// is strictly increasing within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current state of a playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, sink allocated, nothing delivered yet.
    Idle,
    /// At least one chunk delivered; output auto-starts.
    Streaming,
    /// Replaced by a newer utterance. Terminal.
    Superseded,
    /// Paused by the user. Chunks keep buffering but output stays paused.
    Stopped,
    /// The socket closed while the session was active. No more chunks can
    /// arrive for it.
    ConnectionLost,
}

/// Result of one append's completion signal.
#[derive(Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The chunk was accepted. `playback` is the outcome of the auto-start
    /// attempt, if one was made.
    Appended {
        bytes: usize,
        playback: Option<Result<(), SinkError>>,
    },
    /// The sink rejected the chunk; draining continues with the next one.
    Rejected { bytes: usize, error: SinkError },
}

/// Playback of one utterance: its queue, its sink and its state.
pub struct PlaybackSession {
    id: SessionId,
    state: SessionState,
    queue: ChunkQueue,
    sink: Option<Box<dyn StreamingAudioSink>>,
    /// Size of the chunk in flight and its completion signal.
    in_flight: Option<(usize, AppendCompletion)>,
    playing: bool,
}

impl PlaybackSession {
    pub fn new(id: SessionId, sink: Box<dyn StreamingAudioSink>) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            queue: ChunkQueue::new(),
            sink: Some(sink),
            in_flight: None,
            playing: false,
        }
    }

    pub const fn id(&self) -> SessionId {
        self.id
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Chunks waiting behind the in-flight one.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub const fn is_playing(&self) -> bool {
        self.playing
    }

    /// Take a chunk that arrived for this session.
    pub fn accept(&mut self, chunk: Bytes) -> Result<(), DiscardReason> {
        match self.state {
            SessionState::Superseded => Err(DiscardReason::Superseded),
            SessionState::ConnectionLost => Err(DiscardReason::ConnectionLost),
            SessionState::Idle | SessionState::Streaming | SessionState::Stopped => {
                if self.queue.enqueue(chunk) {
                    Ok(())
                } else {
                    Err(DiscardReason::Superseded)
                }
            }
        }
    }

    /// Deliver the next chunk if the sink can take it.
    ///
    /// Returns the new state when the first delivery moves the session from
    /// `Idle` to `Streaming`.
    pub fn pump(&mut self) -> Option<SessionState> {
        if self.in_flight.is_some() {
            return None;
        }
        let sink = self.sink.as_deref_mut()?;
        let bytes = self.queue.front_len().unwrap_or(0);
        let completion = self.queue.drain(sink)?;
        self.in_flight = Some((bytes, completion));

        tracing::debug!(session = %self.id, bytes, queued = self.queue.len(), "Chunk handed to sink");

        if self.state == SessionState::Idle {
            self.state = SessionState::Streaming;
            return Some(SessionState::Streaming);
        }
        None
    }

    /// Wait for the in-flight append to resolve. Pending forever when
    /// nothing is in flight, so it can sit in a `select!`.
    pub async fn next_append(&mut self) -> Result<(), SinkError> {
        match self.in_flight.as_mut() {
            Some((_, completion)) => completion.await,
            None => std::future::pending().await,
        }
    }

    /// Record the outcome of the append that [`next_append`](Self::next_append)
    /// just returned, and auto-start output after the first success.
    pub fn on_append_complete(&mut self, result: Result<(), SinkError>) -> AppendOutcome {
        let bytes = self.in_flight.take().map_or(0, |(bytes, _)| bytes);
        self.queue.complete();

        if let Err(error) = result {
            tracing::warn!(session = %self.id, bytes, error = %error, "Sink rejected chunk, skipping");
            return AppendOutcome::Rejected { bytes, error };
        }

        let playback = if self.state == SessionState::Streaming && !self.playing {
            self.sink.as_deref_mut().map(|sink| {
                let started = sink.play();
                self.playing = started.is_ok();
                started
            })
        } else {
            None
        };

        AppendOutcome::Appended { bytes, playback }
    }

    /// Pause output. Repeated calls only re-pause the sink.
    pub fn stop(&mut self) -> Option<SessionState> {
        if let Some(sink) = self.sink.as_deref_mut() {
            sink.pause();
        }
        self.playing = false;

        match self.state {
            SessionState::Idle | SessionState::Streaming => {
                self.state = SessionState::Stopped;
                Some(SessionState::Stopped)
            }
            _ => None,
        }
    }

    /// The socket closed under this session.
    pub fn connection_lost(&mut self) -> Option<SessionState> {
        match self.state {
            SessionState::Idle | SessionState::Streaming => {
                self.state = SessionState::ConnectionLost;
                Some(SessionState::ConnectionLost)
            }
            _ => None,
        }
    }

    /// Hard cutover to a newer utterance.
    ///
    /// Returns the queued chunks that were discarded and the completion
    /// signal of an append that was already in flight, which the caller may
    /// let finish. The sink is released.
    pub fn supersede(&mut self) -> (Vec<Bytes>, Option<AppendCompletion>) {
        if self.state == SessionState::Superseded {
            return (Vec::new(), None);
        }
        let released = self.release();
        self.state = SessionState::Superseded;
        released
    }

    /// Discard queued chunks and release the sink without a state change.
    pub fn release(&mut self) -> (Vec<Bytes>, Option<AppendCompletion>) {
        let dropped = self.queue.cancel();
        let in_flight = self.in_flight.take().map(|(_, completion)| completion);
        if let Some(mut sink) = self.sink.take() {
            sink.pause();
        }
        self.playing = false;
        (dropped, in_flight)
    }
}

impl fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("queued", &self.queue.len())
            .field("in_flight", &self.in_flight.is_some())
            .field("playing", &self.playing)
            .finish_non_exhaustive()
    }
}
