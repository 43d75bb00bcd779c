//! Speaker output via `rodio`, decoding the MP3 stream with `minimp3`.
//!
//! `rodio::OutputStream` is `!Send`, so it lives on a dedicated thread for
//! the lifetime of the [`RodioSinkFactory`]; only its `Send` handle crosses
//! into the engine.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, mpsc};

use bytes::Bytes;
use minimp3::Decoder;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};

use crate::audio_io::{AppendCompletion, SinkFactory, StreamingAudioSink, completed};
use crate::error::SinkError;

/// Bytes appended but not yet consumed by the decoder.
#[derive(Clone, Default)]
struct PendingBytes(Arc<Mutex<VecDeque<u8>>>);

impl PendingBytes {
    fn extend(&self, chunk: &[u8]) -> Result<(), SinkError> {
        self.0
            .lock()
            .map_err(|_| SinkError::Decode("decoder buffer poisoned".to_string()))?
            .extend(chunk);
        Ok(())
    }
}

impl Read for PendingBytes {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("decoder buffer poisoned"))?
            .read(buf)
    }
}

/// Plays one utterance on the default output device.
///
/// The decoder keeps its state across appends, so an MPEG frame split over
/// two chunks decodes once its second half arrives.
pub struct RodioSink {
    sink: Sink,
    pending: PendingBytes,
    decoder: Decoder<PendingBytes>,
}

impl RodioSink {
    fn new(handle: &OutputStreamHandle) -> Result<Self, SinkError> {
        let sink = Sink::try_new(handle).map_err(|e| SinkError::Output(e.to_string()))?;
        // Attached paused; the engine starts it after the first append.
        sink.pause();

        let pending = PendingBytes::default();
        Ok(Self {
            sink,
            decoder: Decoder::new(pending.clone()),
            pending,
        })
    }

    /// Queue every complete frame currently buffered. Returns how many.
    fn decode_available(&mut self) -> Result<usize, SinkError> {
        let mut frames = 0;
        loop {
            match self.decoder.next_frame() {
                Ok(frame) => {
                    let channels = u16::try_from(frame.channels)
                        .map_err(|_| SinkError::Decode(format!("{} channels", frame.channels)))?;
                    let sample_rate = u32::try_from(frame.sample_rate).map_err(|_| {
                        SinkError::Decode(format!("sample rate {}", frame.sample_rate))
                    })?;
                    self.sink
                        .append(SamplesBuffer::new(channels, sample_rate, frame.data));
                    frames += 1;
                }
                // Out of bytes; a partial frame stays buffered in the decoder.
                Err(minimp3::Error::Eof | minimp3::Error::InsufficientData) => return Ok(frames),
                Err(minimp3::Error::SkippedData) => {}
                Err(minimp3::Error::Io(e)) => return Err(SinkError::Decode(e.to_string())),
            }
        }
    }
}

impl StreamingAudioSink for RodioSink {
    fn is_ready(&self) -> bool {
        true
    }

    fn append(&mut self, chunk: Bytes) -> AppendCompletion {
        let result = self
            .pending
            .extend(&chunk)
            .and_then(|()| self.decode_available());
        match &result {
            Ok(frames) => tracing::trace!(bytes = chunk.len(), frames, "Chunk decoded"),
            Err(e) => tracing::warn!(bytes = chunk.len(), error = %e, "Chunk decode failed"),
        }
        completed(result.map(|_| ()))
    }

    fn play(&mut self) -> Result<(), SinkError> {
        self.sink.play();
        Ok(())
    }

    fn pause(&mut self) {
        self.sink.pause();
    }
}

/// Creates a [`RodioSink`] per utterance on the default output device.
pub struct RodioSinkFactory {
    handle: OutputStreamHandle,
    /// Dropping this ends the thread holding the output stream.
    _keep_alive: mpsc::Sender<()>,
}

impl RodioSinkFactory {
    pub fn new() -> Result<Self, SinkError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (keep_alive, parked) = mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("paperplay-audio-output".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SinkError::Output(e.to_string())));
                        return;
                    }
                };
                if ready_tx.send(Ok(handle)).is_err() {
                    return;
                }
                // Returns once the factory is dropped.
                let _ = parked.recv();
                tracing::debug!("Audio output thread exiting");
            })
            .map_err(|e| SinkError::Output(e.to_string()))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| SinkError::Output("audio output thread died".to_string()))??;

        tracing::info!("Audio playback initialized on default output device");
        Ok(Self {
            handle,
            _keep_alive: keep_alive,
        })
    }
}

impl SinkFactory for RodioSinkFactory {
    fn create(&self) -> Result<Box<dyn StreamingAudioSink>, SinkError> {
        Ok(Box::new(RodioSink::new(&self.handle)?))
    }
}
