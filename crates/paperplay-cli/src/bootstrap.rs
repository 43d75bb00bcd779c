//! Composition: turn parsed arguments into engine parts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use paperplay_voice::{FileSinkFactory, SinkError, SinkFactory, VoiceEngineConfig};

use crate::parser::Cli;

/// Recording used when neither `--output` nor `--play` is given.
pub const DEFAULT_OUTPUT: &str = "utterance.mp3";

pub fn engine_config(cli: &Cli) -> VoiceEngineConfig {
    let mut config = cli
        .url
        .as_ref()
        .map_or_else(VoiceEngineConfig::default, VoiceEngineConfig::with_endpoint);
    config.reconnect_delay = Duration::from_millis(cli.reconnect_delay_ms);
    config
}

/// Pick the audio output: speakers with `--play`, numbered MP3 files otherwise.
pub fn sink_factory(cli: &Cli) -> Result<Arc<dyn SinkFactory>, SinkError> {
    #[cfg(feature = "playback")]
    if cli.play {
        return Ok(Arc::new(paperplay_voice::RodioSinkFactory::new()?));
    }

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));
    tracing::info!(path = %output.display(), "Recording utterances");
    Ok(Arc::new(FileSinkFactory::new(output)))
}
