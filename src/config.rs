//! Client configuration.
//!
//! All sections deserialize from JSON with every field optional; missing
//! fields take the defaults below.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::ice::{google_stun_servers, IceServerConfig};

/// Default heartbeat period used by the browser and native clients.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: i64 = 5000;

/// Label of the data channel the caller creates on every peer connection.
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "SendDataChannel";

/// How roster bodies delivered by `/wait` are interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RosterUpdateMode {
    /// Every roster body is the full list of signed-in peers.
    #[default]
    Snapshot,
    /// Every roster body is a single `name,id,connected` change.
    Incremental,
}

/// Rendezvous server session settings
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Heartbeat period; `<= 0` disables heartbeats
    pub heartbeat_interval_ms: i64,
    /// How long a `/wait` request may stay open before it is re-issued
    pub long_poll_timeout_ms: u64,
    /// Timeout for sign-in, sign-out, message, heartbeat and capacity requests
    pub request_timeout_ms: u64,
    /// Pause before re-issuing `/wait` after a recoverable failure
    pub poll_retry_delay_ms: u64,
    /// Consecutive transport failures that end the long-poll loop
    pub max_consecutive_poll_failures: u32,
    /// Value of the `Authorization` header attached to every request
    pub authorization: Option<String>,
    pub roster_updates: RosterUpdateMode,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            long_poll_timeout_ms: 120_000,
            request_timeout_ms: 10_000,
            poll_retry_delay_ms: 1_000,
            max_consecutive_poll_failures: 3,
            authorization: None,
            roster_updates: RosterUpdateMode::Snapshot,
        }
    }
}

impl RendezvousConfig {
    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_retry_delay(&self) -> Duration {
        Duration::from_millis(self.poll_retry_delay_ms)
    }
}

/// Local media requested for every new peer connection.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Peer connection settings
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Audio codec moved to the front of the `m=audio` line (e.g. "opus")
    pub preferred_audio_codec: Option<String>,
    /// Video codec moved to the front of the `m=video` line (e.g. "H264")
    pub preferred_video_codec: Option<String>,
    pub data_channel_label: String,
    pub media: MediaConstraints,
    /// Re-emit engine connection-state changes as health events
    pub connection_health_stats: bool,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ice_servers: google_stun_servers(),
            preferred_audio_codec: None,
            preferred_video_codec: None,
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            media: MediaConstraints::default(),
            connection_health_stats: false,
        }
    }
}

/// Top-level configuration for a signaling client
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub rendezvous: RendezvousConfig,
    pub negotiator: NegotiatorConfig,
}

impl ClientConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
