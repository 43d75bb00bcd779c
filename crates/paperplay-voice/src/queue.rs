//! Ordered, one-at-a-time hand-off of chunks to a sink.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::audio_io::{AppendCompletion, StreamingAudioSink};

/// FIFO of encoded chunks waiting for their sink.
///
/// Backpressure: [`drain`](Self::drain) starts at most one append and then
/// refuses to start another until [`complete`](Self::complete) is called
/// with that append's outcome. The owner is the only mutator, so discarding
/// on [`cancel`](Self::cancel) cannot interleave with a drain.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    pending: VecDeque<Bytes>,
    in_flight: bool,
    cancelled: bool,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk to the back.
    ///
    /// Returns `false` (and drops the chunk) only once the queue is cancelled.
    pub fn enqueue(&mut self, chunk: Bytes) -> bool {
        if self.cancelled {
            return false;
        }
        self.pending.push_back(chunk);
        true
    }

    /// Hand the front chunk to `sink` if nothing is in flight and the sink is
    /// ready. Returns the append's completion signal.
    pub fn drain(&mut self, sink: &mut dyn StreamingAudioSink) -> Option<AppendCompletion> {
        if self.in_flight || self.cancelled || !sink.is_ready() {
            return None;
        }
        let chunk = self.pending.pop_front()?;
        self.in_flight = true;
        Some(sink.append(chunk))
    }

    /// The in-flight append resolved (either way); the next chunk may go.
    pub fn complete(&mut self) {
        self.in_flight = false;
    }

    /// Discard every unconsumed chunk and refuse further deliveries.
    ///
    /// An append already in flight is not affected. Returns the dropped
    /// chunks, oldest first.
    pub fn cancel(&mut self) -> Vec<Bytes> {
        self.cancelled = true;
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Size of the chunk that the next drain would deliver.
    pub fn front_len(&self) -> Option<usize> {
        self.pending.front().map(Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub const fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}
