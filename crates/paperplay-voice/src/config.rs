//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::VoiceError;

/// Hosted backend used when no endpoint is configured.
pub const DEFAULT_HOST: &str = "paperplayground.onrender.com";

/// Path of the voice streaming socket on the backend.
pub const VOICE_STREAM_PATH: &str = "/api/v1/voice/stream";

/// Fixed delay between a socket close and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Configuration for a [`SpeakController`](crate::controller::SpeakController).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceEngineConfig {
    /// WebSocket endpoint of the speech-synthesis backend.
    pub endpoint: String,

    /// Delay before reconnecting after any socket close.
    ///
    /// Applied unconditionally and forever, with no growth and no jitter.
    #[serde(rename = "reconnect_delay_ms", with = "duration_millis")]
    pub reconnect_delay: Duration,
}

impl Default for VoiceEngineConfig {
    fn default() -> Self {
        Self {
            endpoint: Self::endpoint_for_host(DEFAULT_HOST, true),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl VoiceEngineConfig {
    /// Create a config for an explicit endpoint with the default reconnect delay.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Build the voice socket URL for `host`, using `wss` when the page
    /// itself was served securely.
    pub fn endpoint_for_host(host: &str, secure: bool) -> String {
        let scheme = if secure { "wss" } else { "ws" };
        format!("{scheme}://{host}{VOICE_STREAM_PATH}")
    }

    /// Parse and check the endpoint. Only `ws` and `wss` are accepted.
    pub fn endpoint_url(&self) -> Result<Url, VoiceError> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| VoiceError::Config(format!("endpoint '{}': {e}", self.endpoint)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(VoiceError::Config(format!(
                "endpoint scheme must be ws or wss, got '{other}'"
            ))),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
