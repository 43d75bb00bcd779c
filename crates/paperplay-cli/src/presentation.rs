//! Human-readable rendering of engine events.

use paperplay_voice::{ConnectionEvent, EngineEvent, SessionState};

/// One status line for `event`, or `None` for events only worth a log line.
pub fn describe(event: &EngineEvent) -> Option<String> {
    let line = match event {
        EngineEvent::Connection(ConnectionEvent::Opened) => "connected".to_string(),
        EngineEvent::Connection(ConnectionEvent::Closed { reason }) => {
            format!("disconnected: {reason}")
        }
        EngineEvent::Connection(ConnectionEvent::ReconnectScheduled { delay }) => {
            format!("reconnecting in {} ms", delay.as_millis())
        }
        EngineEvent::SessionState { session, state } => match state {
            SessionState::Streaming => format!("{session} playing"),
            SessionState::Stopped => format!("{session} stopped"),
            SessionState::Superseded => format!("{session} interrupted"),
            SessionState::ConnectionLost => format!("{session} cut off"),
            SessionState::Idle => return None,
        },
        EngineEvent::ServerError { message } => format!("server error: {message}"),
        EngineEvent::NotConnected => "not connected, line dropped".to_string(),
        EngineEvent::SinkUnavailable { error } => format!("no audio output: {error}"),
        _ => return None,
    };
    Some(line)
}
