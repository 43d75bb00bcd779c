//! Voice engine error types.
//!
//! None of these are fatal. Connection failures feed the reconnect loop,
//! protocol and decode failures are absorbed and reported as
//! [`EngineEvent`](crate::events::EngineEvent)s. Only [`VoiceError`] is ever
//! returned to a caller of [`SpeakController`](crate::controller::SpeakController).

/// Socket-level failures. Always transient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// Opening the socket failed (DNS, TCP, TLS or WebSocket handshake).
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// Reading from or writing to an open socket failed.
    #[error("Socket I/O failed: {0}")]
    Io(String),

    /// The peer closed the socket or the stream ended.
    #[error("Socket closed")]
    Closed,
}

/// A text frame that could not be read or written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("Malformed control frame: {0}")]
    MalformedJson(String),

    /// An outgoing request could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(String),
}

/// Failures reported by a [`StreamingAudioSink`](crate::audio_io::StreamingAudioSink).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The sink rejected an appended chunk.
    #[error("Failed to decode audio chunk: {0}")]
    Decode(String),

    /// The output device or player could not be opened or started.
    #[error("Audio output error: {0}")]
    Output(String),

    /// Writing the chunk out failed.
    #[error("Sink I/O error: {0}")]
    Io(String),

    /// The sink was released before the append finished.
    #[error("Sink closed")]
    Closed,
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors returned by the public controller surface.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// The engine task has shut down; the handle is no longer usable.
    #[error("Voice engine is not running")]
    EngineStopped,

    /// Invalid engine configuration.
    #[error("Invalid voice engine configuration: {0}")]
    Config(String),

    /// Socket failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Audio sink failure.
    #[error(transparent)]
    Sink(#[from] SinkError),
}
