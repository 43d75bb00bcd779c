//! Wire protocol of the voice streaming socket.
//!
//! | Direction | Frame | Content |
//! |---|---|---|
//! | Client → Server | Text | `{"text": "<utterance>"}`, one per `speak()` |
//! | Server → Client | Binary | One segment of an MPEG audio stream |
//! | Server → Client | Text | JSON control message, only `{"type":"error","error":"..."}` is understood |
//!
//! Binary frames carry no length prefix and no sequence number. Ordering is
//! the socket's arrival order and nothing else. The two message classes are
//! told apart by frame type, never by content.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::error::ProtocolError;

/// One WebSocket data frame, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Encoded audio (server → client).
    Binary(Bytes),
    /// JSON text (requests, control messages).
    Text(String),
}

/// The request sent once per utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UtteranceRequest {
    pub text: String,
}

impl UtteranceRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Encode as the text frame the backend expects.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        serde_json::to_string(self)
            .map(Frame::Text)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// A parsed server → client text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// The backend failed to synthesize the current utterance.
    Error { message: String },
    /// Valid JSON of any other shape.
    Unrecognized,
}

/// Parse a control frame, best effort.
///
/// The human-readable text is taken from `error`, falling back to `detail`
/// (the story socket's spelling of the same field).
pub fn parse_control(text: &str) -> Result<ControlMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

    if value.get("type").and_then(Value::as_str) != Some("error") {
        return Ok(ControlMessage::Unrecognized);
    }

    let message = ["error", "detail"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or("unspecified error")
        .to_string();

    Ok(ControlMessage::Error { message })
}
