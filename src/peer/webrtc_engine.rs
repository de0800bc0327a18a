//! webrtc-rs implementation of the media engine boundary.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{
    MediaEngine as RtcMediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::engine::{
    DataChannel, EngineEvent, LocalMediaStream, MediaEngine, MediaRequest, MediaTrack,
    PeerConnectionConfig, PeerConnectionHandle, PeerConnectionState, RemoteTrack, TrackKind,
};
use crate::error::EngineError;
use crate::signaling::message::{IceCandidate, SdpType, SessionDescription};

/// Stream id of the local capture stream.
pub const LOCAL_STREAM_ID: &str = "rendezvous-webrtc";

/// Media engine backed by webrtc-rs.
pub struct WebRtcEngine {
    api: API,
    next_stream: AtomicU64,
}

impl WebRtcEngine {
    /// Build the webrtc-rs API with default codecs and interceptors.
    pub fn new() -> Result<Self, EngineError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::PeerConnection(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            EngineError::PeerConnection(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            next_stream: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_peer_connection(
        &self,
        config: &PeerConnectionConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn PeerConnectionHandle>, EngineError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|s| s.to_rtc_ice_server())
                .collect(),
            ..Default::default()
        };

        let peer_connection = self
            .api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| EngineError::PeerConnection(e.to_string()))?;
        let peer_connection = Arc::new(peer_connection);

        register_callbacks(&peer_connection, events.clone());

        Ok(Arc::new(WebRtcPeerConnection {
            peer_connection,
            events,
        }))
    }

    async fn get_user_media(&self, request: &MediaRequest) -> Result<LocalMediaStream, EngineError> {
        let n = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();

        if request.constraints.audio {
            let capability = RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            };
            tracks.push(Arc::new(WebRtcLocalTrack::new(
                format!("audio-{}", n),
                TrackKind::Audio,
                capability,
            )));
        }

        if request.constraints.video {
            let capability = RTCRtpCodecCapability {
                mime_type: video_mime_type(request.video_codec.as_deref()).to_owned(),
                clock_rate: 90000,
                ..Default::default()
            };
            tracks.push(Arc::new(WebRtcLocalTrack::new(
                format!("video-{}", n),
                TrackKind::Video,
                capability,
            )));
        }

        if tracks.is_empty() {
            return Err(EngineError::Media("no audio or video requested".to_string()));
        }

        Ok(LocalMediaStream {
            id: LOCAL_STREAM_ID.to_string(),
            tracks,
        })
    }
}

fn video_mime_type(preferred: Option<&str>) -> &'static str {
    match preferred.map(str::to_ascii_lowercase).as_deref() {
        Some("h264") => MIME_TYPE_H264,
        Some("vp9") => MIME_TYPE_VP9,
        _ => MIME_TYPE_VP8,
    }
}

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn register_callbacks(
    peer_connection: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let tx_for_ice = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx_for_ice.clone();
        Box::pin(async move {
            let Some(c) = candidate else {
                return;
            };
            match c.to_json() {
                Ok(init) => {
                    let _ = tx.send(EngineEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid.unwrap_or_default(),
                        sdp_mline_index: init.sdp_mline_index.unwrap_or_default(),
                    }));
                }
                Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
            }
        })
    }));

    // Remote tracks are reported removed when the connection ends
    let remote_tracks: Arc<Mutex<Vec<RemoteTrack>>> = Arc::new(Mutex::new(Vec::new()));

    let tx_for_track = events.clone();
    let tracks_for_add = remote_tracks.clone();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            let remote = RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            };
            info!("Remote {} track added: {}", kind.as_str(), remote.id);
            tracks_for_add.lock().push(remote.clone());
            let _ = tx_for_track.send(EngineEvent::RemoteTrackAdded(remote));
            Box::pin(async {})
        },
    ));

    let tx_for_state = events.clone();
    let tracks_for_state = remote_tracks;
    peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let state = map_state(s);
        debug!("Peer connection state: {:?}", state);
        if state.is_terminal() {
            for track in tracks_for_state.lock().drain(..) {
                let _ = tx_for_state.send(EngineEvent::RemoteTrackRemoved(track));
            }
        }
        let _ = tx_for_state.send(EngineEvent::ConnectionStateChanged(state));
        Box::pin(async {})
    }));

    // Channels opened by the remote side
    let tx_for_dc = events;
    peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx_for_dc.clone();
        Box::pin(async move {
            info!("Remote data channel opened: {}", dc.label());
            forward_messages(&dc, tx.clone());
            let _ = tx.send(EngineEvent::DataChannelOpened(Arc::new(WebRtcDataChannel {
                channel: dc,
            })));
        })
    }));
}

fn forward_messages(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<EngineEvent>) {
    let label = dc.label().to_string();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            let _ = events.send(EngineEvent::DataChannelMessage {
                label: label.clone(),
                text,
            });
        } else {
            debug!("Ignoring {} byte binary message on '{}'", msg.data.len(), label);
        }
        Box::pin(async {})
    }));
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
    };
    result.map_err(|e| EngineError::SessionDescription(format!("Invalid SDP: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        other => {
            return Err(EngineError::SessionDescription(format!(
                "Unexpected description type {}",
                other
            )))
        }
    };
    Ok(SessionDescription::new(sdp_type, description.sdp))
}

/// Single webrtc-rs peer connection
struct WebRtcPeerConnection {
    peer_connection: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

#[async_trait]
impl PeerConnectionHandle for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| EngineError::SessionDescription(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| EngineError::SessionDescription(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| {
                EngineError::SessionDescription(format!("Failed to set local description: {}", e))
            })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| {
                EngineError::SessionDescription(format!("Failed to set remote description: {}", e))
            })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| EngineError::IceCandidate(e.to_string()))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| EngineError::DataChannel(e.to_string()))?;

        forward_messages(&channel, self.events.clone());
        Ok(Arc::new(WebRtcDataChannel { channel }))
    }

    async fn add_stream(&self, stream: &LocalMediaStream) -> Result<(), EngineError> {
        for track in &stream.tracks {
            let Some(local) = track.as_any().downcast_ref::<WebRtcLocalTrack>() else {
                return Err(EngineError::Media(format!(
                    "track {} was not created by this engine",
                    track.id()
                )));
            };
            let _rtp_sender = self
                .peer_connection
                .add_track(local.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| EngineError::Media(format!("Failed to add track: {}", e)))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| EngineError::Close(e.to_string()))
    }
}

struct WebRtcDataChannel {
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    async fn send_text(&self, text: &str) -> Result<(), EngineError> {
        self.channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| EngineError::DataChannel(format!("Failed to send data: {}", e)))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.channel
            .close()
            .await
            .map_err(|e| EngineError::DataChannel(e.to_string()))
    }
}

/// Local track fed by the application through `write_sample`.
pub struct WebRtcLocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcLocalTrack {
    fn new(id: String, kind: TrackKind, capability: RTCRtpCodecCapability) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            LOCAL_STREAM_ID.to_string(),
        ));
        Self {
            id,
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Write one encoded frame. Dropped while the track is disabled or stopped.
    pub async fn write_sample(&self, data: Bytes, duration: std::time::Duration) -> Result<(), EngineError> {
        if !self.is_enabled() || self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::Media(e.to_string()))
    }
}

impl MediaTrack for WebRtcLocalTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
