//! Streaming voice engine.
//!
//! Sends utterance requests over a reconnecting WebSocket (one socket per
//! utterance) and plays the MP3 chunks that come back, strictly in order,
//! one append at a time.
//! A new utterance always supersedes the previous one; no audio of an old
//! utterance ever reaches the sink of a newer one.
//!
//! ```no_run
//! # async fn demo() -> Result<(), paperplay_voice::VoiceError> {
//! use std::sync::Arc;
//! use paperplay_voice::{FileSinkFactory, SpeakController, VoiceEngineConfig, WsConnector};
//!
//! let (voice, mut events) = SpeakController::spawn(
//!     &VoiceEngineConfig::default(),
//!     Arc::new(WsConnector),
//!     Arc::new(FileSinkFactory::new("speech.mp3")),
//! )?;
//! voice.speak("Hello there").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```
#![deny(unused_crate_dependencies)]

pub mod audio_io;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod events;
pub mod file_sink;
#[cfg(feature = "playback")]
pub mod playback;
pub mod protocol;
pub mod queue;
pub mod session;

// Re-export key types for convenience
pub use audio_io::{AppendCompletion, SinkFactory, StreamingAudioSink};
pub use config::VoiceEngineConfig;
pub use connection::{
    ConnectionManager, ConnectionSignal, ConnectionState, ConnectionStatus, Connector, Socket,
    WsConnector,
};
pub use controller::{EngineSnapshot, SessionSnapshot, SpeakController};
pub use error::{ConnectionError, ProtocolError, SinkError, VoiceError};
pub use events::{ConnectionEvent, DiscardReason, EngineEvent};
pub use file_sink::{FileSink, FileSinkFactory};
#[cfg(feature = "playback")]
pub use playback::{RodioSink, RodioSinkFactory};
pub use protocol::Frame;
pub use queue::ChunkQueue;
pub use session::{PlaybackSession, SessionId, SessionState};
