//! Events emitted by the engine to the UI / application layer.
//!
//! Every failure mode of the engine is silent from the caller's point of
//! view (no audio rather than an error). These events make each of them
//! observable and testable.

use std::fmt;
use std::time::Duration;

use crate::error::{ConnectionError, ProtocolError, SinkError};
use crate::session::{SessionId, SessionState};

/// Lifecycle of the synthesis socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection attempt started.
    Connecting,
    /// The socket is open; requests can be sent.
    Opened,
    /// The socket closed or a connection attempt failed.
    Closed { reason: ConnectionError },
    /// The next connection attempt will start after `delay`.
    ReconnectScheduled { delay: Duration },
    /// A request was dropped because the socket was not open.
    SendRejected,
}

/// Why a received chunk never reached a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Its session was superseded by a newer utterance.
    Superseded,
    /// It answers a request older than the current session's.
    Stale,
    /// No utterance was requested on this socket, or no session exists.
    NoSession,
    /// Its session already lost the connection.
    ConnectionLost,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superseded => write!(f, "superseded"),
            Self::Stale => write!(f, "stale"),
            Self::NoSession => write!(f, "no session"),
            Self::ConnectionLost => write!(f, "connection lost"),
        }
    }
}

/// Observable engine signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Socket lifecycle change.
    Connection(ConnectionEvent),

    /// A playback session changed state.
    SessionState {
        session: SessionId,
        state: SessionState,
    },

    /// No sink could be created for a new utterance; nothing was requested.
    SinkUnavailable { error: SinkError },

    /// A chunk was appended to the session's sink.
    ChunkAppended { session: SessionId, bytes: usize },

    /// A chunk was dropped without reaching a sink.
    ChunkDiscarded {
        session: Option<SessionId>,
        bytes: usize,
        reason: DiscardReason,
    },

    /// The sink rejected a chunk; later chunks are still delivered.
    DecodeFailed {
        session: SessionId,
        error: SinkError,
    },

    /// Output started after the first completed append.
    PlaybackStarted { session: SessionId },

    /// The sink refused to start output.
    PlaybackRejected {
        session: SessionId,
        error: SinkError,
    },

    /// The backend reported a synthesis failure.
    ServerError { message: String },

    /// A text frame could not be parsed.
    ProtocolError { error: ProtocolError },

    /// `speak()` was ignored because the socket was not open.
    NotConnected,
}
