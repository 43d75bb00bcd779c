//! CLI entry point - the composition root.
//!
//! Wires the WebSocket connector and the chosen audio sink into a voice
//! engine, then feeds it stdin line by line.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use paperplay_cli::{Cli, Input, describe, engine_config, parse_line, sink_factory};
use paperplay_voice::{SpeakController, WsConnector};

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "info,paperplay_voice=debug,paperplay_cli=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before clap reads its env fallbacks
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = engine_config(&cli);
    let sinks = sink_factory(&cli)?;
    let (voice, mut events) = SpeakController::spawn(&config, Arc::new(WsConnector), sinks)?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!(?event, "Engine event");
            if let Some(line) = describe(&event) {
                println!("{line}");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else {
            // Let the last utterance finish streaming.
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(cli.linger)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            break;
        };

        match parse_line(&line) {
            Input::Speak(text) => {
                if let Some(id) = voice.speak(text).await? {
                    tracing::debug!(session = %id, "Utterance requested");
                }
            }
            Input::Stop => voice.stop().await?,
            Input::Quit => break,
            Input::Blank => {}
        }
    }

    voice.shutdown().await?;
    printer.await?;
    Ok(())
}
