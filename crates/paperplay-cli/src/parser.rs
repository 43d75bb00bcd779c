//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Speak lines of text through the paperplay voice stream.
///
/// Each stdin line is spoken as soon as it is read, replacing whatever is
/// still playing. `:stop` pauses playback, `:quit` (or end of input) exits.
#[derive(Parser, Debug)]
#[command(name = "paperplay-voice")]
#[command(about = "Speak lines of text through the paperplay voice stream")]
#[command(version)]
pub struct Cli {
    /// WebSocket endpoint of the voice stream [default: the hosted backend]
    #[arg(long, env = "PAPERPLAY_VOICE_URL")]
    pub url: Option<String>,

    /// Delay before reconnecting after the socket closes
    #[arg(
        long = "reconnect-delay-ms",
        env = "PAPERPLAY_RECONNECT_DELAY_MS",
        default_value_t = 2000,
        value_name = "MS"
    )]
    pub reconnect_delay_ms: u64,

    /// Record each utterance to `<stem>-<n>.mp3` next to FILE
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Play through the default output device
    #[cfg(feature = "playback")]
    #[arg(long, conflicts_with = "output")]
    pub play: bool,

    /// Keep streaming this long after input ends
    #[arg(long, default_value_t = 5, value_name = "SECS")]
    pub linger: u64,

    /// Enable verbose/debug output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}
