//! Media engine boundary.
//!
//! The negotiator drives peer connections only through these traits, so the
//! same state machine runs against webrtc-rs or a scripted test engine.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::MediaConstraints;
use crate::error::EngineError;
use crate::ice::IceServerConfig;
use crate::signaling::message::{IceCandidate, SessionDescription};

/// Settings for a new peer connection
#[derive(Clone, Debug, Default)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<IceServerConfig>,
}

/// Local media request
#[derive(Clone, Debug, Default)]
pub struct MediaRequest {
    pub constraints: MediaConstraints,
    /// Video codec the local track should carry, if the engine supports it
    pub video_codec: Option<String>,
}

/// Track kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Peer connection state as reported by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

/// A track received from the remote peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Callback-style notifications from a live peer connection.
///
/// Engines push these into the channel handed to `create_peer_connection`.
pub enum EngineEvent {
    IceCandidate(IceCandidate),
    RemoteTrackAdded(RemoteTrack),
    RemoteTrackRemoved(RemoteTrack),
    DataChannelOpened(Arc<dyn DataChannel>),
    DataChannelMessage { label: String, text: String },
    ConnectionStateChanged(PeerConnectionState),
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            EngineEvent::RemoteTrackAdded(t) => f.debug_tuple("RemoteTrackAdded").field(t).finish(),
            EngineEvent::RemoteTrackRemoved(t) => {
                f.debug_tuple("RemoteTrackRemoved").field(t).finish()
            }
            EngineEvent::DataChannelOpened(dc) => {
                f.debug_tuple("DataChannelOpened").field(&dc.label()).finish()
            }
            EngineEvent::DataChannelMessage { label, text } => f
                .debug_struct("DataChannelMessage")
                .field("label", label)
                .field("text", text)
                .finish(),
            EngineEvent::ConnectionStateChanged(s) => {
                f.debug_tuple("ConnectionStateChanged").field(s).finish()
            }
        }
    }
}

/// A local capture track.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
    fn as_any(&self) -> &dyn Any;
}

/// Local capture stream attached to a peer connection.
#[derive(Clone)]
pub struct LocalMediaStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalMediaStream {
    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Enable or disable every track of `kind`.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// An open (or opening) data channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    async fn send_text(&self, text: &str) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

/// A peer connection owned by the negotiator.
#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError>;
    async fn add_stream(&self, stream: &LocalMediaStream) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

/// Factory for peer connections and local media.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_peer_connection(
        &self,
        config: &PeerConnectionConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn PeerConnectionHandle>, EngineError>;

    async fn get_user_media(&self, request: &MediaRequest) -> Result<LocalMediaStream, EngineError>;
}
