//! `StreamingAudioSink` and `SinkFactory`: the host-supplied audio output.
//!
//! The engine never decodes audio itself. It hands opaque MPEG segments to a
//! sink one at a time and waits for the sink's completion signal before
//! handing over the next one. Whatever sits behind the trait (a speaker, a
//! file, a browser `SourceBuffer` bridge) only has to honour four operations:
//!
//! | Operation | Meaning |
//! |---|---|
//! | [`SinkFactory::create`] | Allocate a sink attached to a paused player |
//! | [`StreamingAudioSink::append`] | Accept one segment, resolve when done |
//! | [`StreamingAudioSink::is_ready`] | Whether another append may start |
//! | [`play`](StreamingAudioSink::play) / [`pause`](StreamingAudioSink::pause) | Player control |
//!
//! | Implementor | Where used |
//! |---|---|
//! | [`FileSink`](crate::file_sink::FileSink) | CLI `--output`, records the MP3 stream |
//! | `RodioSink` | CLI `--play` (feature `playback`), local speakers |

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::error::SinkError;

/// Completion signal of one [`StreamingAudioSink::append`] call.
///
/// Resolves once the sink can take the next chunk. `Err` means this chunk
/// was rejected; the sink remains usable.
pub type AppendCompletion = BoxFuture<'static, Result<(), SinkError>>;

/// An append that finished synchronously.
pub fn completed(result: Result<(), SinkError>) -> AppendCompletion {
    Box::pin(std::future::ready(result))
}

/// Output for one utterance's encoded audio.
///
/// At most one append is ever in flight per sink: the engine awaits each
/// [`AppendCompletion`] before calling `append` again.
pub trait StreamingAudioSink: Send {
    /// Whether the sink is able to accept an append right now.
    fn is_ready(&self) -> bool;

    /// Start appending one encoded segment.
    ///
    /// The returned future must not borrow the sink; it may outlive it when
    /// the session owning the sink is superseded mid-append.
    fn append(&mut self, chunk: Bytes) -> AppendCompletion;

    /// Start (or resume) output of the buffered audio.
    fn play(&mut self) -> Result<(), SinkError>;

    /// Pause output. Idempotent.
    fn pause(&mut self);
}

/// Creates one fresh sink per utterance.
pub trait SinkFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn StreamingAudioSink>, SinkError>;
}
