//! Sink that records each utterance's MP3 stream to its own file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audio_io::{AppendCompletion, SinkFactory, StreamingAudioSink};
use crate::error::SinkError;

/// Writes appended segments, unchanged, to one file.
///
/// The write happens when the returned completion is polled, on tokio's
/// blocking pool, never inside `append` itself.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    playing: bool,
}

impl FileSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = std::fs::File::create(&path)?;
        tracing::debug!(path = %path.display(), "Recording utterance");
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(File::from_std(file))),
            playing: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn is_playing(&self) -> bool {
        self.playing
    }
}

async fn write_segment(file: &Mutex<File>, chunk: &[u8]) -> Result<(), SinkError> {
    let mut file = file.lock().await;
    file.write_all(chunk).await?;
    file.flush().await?;
    Ok(())
}

impl StreamingAudioSink for FileSink {
    fn is_ready(&self) -> bool {
        true
    }

    fn append(&mut self, chunk: Bytes) -> AppendCompletion {
        let file = Arc::clone(&self.file);
        let path = self.path.clone();
        Box::pin(async move {
            let result = write_segment(&file, &chunk).await;
            if let Err(e) = &result {
                tracing::warn!(path = %path.display(), error = %e, "Recording write failed");
            }
            result
        })
    }

    fn play(&mut self) -> Result<(), SinkError> {
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.playing = false;
    }
}

/// Hands out [`FileSink`]s named `<stem>-<n>.mp3`, `n` counting from 1.
#[derive(Debug)]
pub struct FileSinkFactory {
    dir: PathBuf,
    stem: String,
    created: AtomicU64,
}

impl FileSinkFactory {
    /// `base` names the recording: `out/speech.mp3` yields `out/speech-1.mp3`,
    /// `out/speech-2.mp3`, ...
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        let dir = base
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let stem = base
            .file_stem()
            .map_or_else(|| "utterance".to_string(), |s| s.to_string_lossy().into_owned());
        Self {
            dir,
            stem,
            created: AtomicU64::new(0),
        }
    }

    /// Path of the `n`th recording.
    pub fn path_for(&self, n: u64) -> PathBuf {
        self.dir.join(format!("{}-{n}.mp3", self.stem))
    }
}

impl SinkFactory for FileSinkFactory {
    fn create(&self) -> Result<Box<dyn StreamingAudioSink>, SinkError> {
        let n = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(FileSink::create(self.path_for(n))?))
    }
}
