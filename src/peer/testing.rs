//! Recording engine and messenger used by the negotiator, bridge and
//! end-to-end tests.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::engine::{
    DataChannel, EngineEvent, LocalMediaStream, MediaEngine, MediaRequest, MediaTrack,
    PeerConnectionConfig, PeerConnectionHandle, TrackKind,
};
use crate::error::{EngineError, SignalingError};
use crate::signaling::message::{IceCandidate, SdpType, SessionDescription};
use crate::signaling::rendezvous::PeerMessenger;

/// Shared call log, so engine and messenger calls interleave in one order.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub const FAKE_SESSION_ID: &str = "4611731400430051336";

pub fn fake_sdp(kind: &str) -> String {
    [
        "v=0",
        &format!("o=- {} 2 IN IP4 127.0.0.1", FAKE_SESSION_ID),
        "s=-",
        "t=0 0",
        "m=audio 9 UDP/TLS/RTP/SAVPF 111 0",
        "a=rtpmap:111 opus/48000/2",
        "a=rtpmap:0 PCMU/8000",
        "m=video 9 UDP/TLS/RTP/SAVPF 96 98 100",
        "a=rtpmap:96 VP8/90000",
        "a=rtpmap:98 VP9/90000",
        "a=rtpmap:100 H264/90000",
        &format!("a=x-kind:{}", kind),
        "",
    ]
    .join("\r\n")
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    pub stopped: AtomicBool,
    log: CallLog,
}

impl MediaTrack for FakeTrack {
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
        self.log.lock().push(format!("stop_track:{}", self.id));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct FakeDataChannel {
    label: String,
    pub sent: Mutex<Vec<String>>,
    log: CallLog,
}

impl FakeDataChannel {
    pub fn new(label: &str, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            log,
        })
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send_text(&self, text: &str) -> Result<(), EngineError> {
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.log.lock().push(format!("close_channel:{}", self.label));
        Ok(())
    }
}

pub struct FakePeerConnection {
    log: CallLog,
    events: mpsc::UnboundedSender<EngineEvent>,
    pub channels: Mutex<Vec<Arc<FakeDataChannel>>>,
}

impl FakePeerConnection {
    /// Inject an engine callback.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: String) {
        self.log.lock().push(call);
    }
}

#[async_trait]
impl PeerConnectionHandle for FakePeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record("create_offer".to_string());
        Ok(SessionDescription::new(SdpType::Offer, fake_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record("create_answer".to_string());
        Ok(SessionDescription::new(SdpType::Answer, fake_sdp("answer")))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.record(format!("set_local:{}", description.sdp_type.as_str()));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.record(format!("set_remote:{}", description.sdp_type.as_str()));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record(format!("add_ice_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        self.record(format!("create_data_channel:{}", label));
        let channel = FakeDataChannel::new(label, self.log.clone());
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn add_stream(&self, stream: &LocalMediaStream) -> Result<(), EngineError> {
        self.record(format!("add_stream:{}", stream.id));
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.record("close".to_string());
        Ok(())
    }
}

/// Engine that records every call and can hold or fail selected steps.
pub struct FakeEngine {
    pub log: CallLog,
    pub fail_create: AtomicBool,
    holds: Mutex<Vec<(&'static str, Arc<Notify>)>>,
    pub connections: Mutex<Vec<Arc<FakePeerConnection>>>,
    pub tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeEngine {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            fail_create: AtomicBool::new(false),
            holds: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
        })
    }

    /// Block the next call of `step` until the returned notify is signalled.
    pub fn hold(&self, step: &'static str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.holds.lock().push((step, notify.clone()));
        notify
    }

    pub fn last_connection(&self) -> Arc<FakePeerConnection> {
        self.connections
            .lock()
            .last()
            .cloned()
            .expect("no peer connection created")
    }

    pub fn track(&self, kind: TrackKind) -> Arc<FakeTrack> {
        self.tracks
            .lock()
            .iter()
            .rev()
            .find(|t| t.kind == kind)
            .cloned()
            .expect("no track of that kind")
    }

    async fn step(&self, step: &'static str) {
        self.log.lock().push(step.to_string());
        let hold = {
            let mut holds = self.holds.lock();
            holds
                .iter()
                .position(|(s, _)| *s == step)
                .map(|i| holds.remove(i).1)
        };
        if let Some(notify) = hold {
            notify.notified().await;
        }
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_peer_connection(
        &self,
        _config: &PeerConnectionConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn PeerConnectionHandle>, EngineError> {
        self.step("create_peer_connection").await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::PeerConnection("scripted failure".to_string()));
        }
        let pc = Arc::new(FakePeerConnection {
            log: self.log.clone(),
            events,
            channels: Mutex::new(Vec::new()),
        });
        self.connections.lock().push(pc.clone());
        Ok(pc)
    }

    async fn get_user_media(&self, request: &MediaRequest) -> Result<LocalMediaStream, EngineError> {
        self.step("get_user_media").await;
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        for (wanted, kind) in [
            (request.constraints.audio, TrackKind::Audio),
            (request.constraints.video, TrackKind::Video),
        ] {
            if wanted {
                let track = Arc::new(FakeTrack {
                    id: kind.as_str().to_string(),
                    kind,
                    enabled: AtomicBool::new(true),
                    stopped: AtomicBool::new(false),
                    log: self.log.clone(),
                });
                self.tracks.lock().push(track.clone());
                tracks.push(track);
            }
        }
        Ok(LocalMediaStream {
            id: "local".to_string(),
            tracks,
        })
    }
}

/// Messenger that records what the negotiator sends.
pub struct RecordingMessenger {
    pub log: CallLog,
    pub sent: Mutex<Vec<(i64, String)>>,
    pub sign_outs: AtomicUsize,
}

impl RecordingMessenger {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            sent: Mutex::new(Vec::new()),
            sign_outs: AtomicUsize::new(0),
        })
    }

    pub fn sent_to(&self, peer_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| *to == peer_id)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl PeerMessenger for RecordingMessenger {
    async fn send_to_peer(&self, peer_id: i64, payload: &str) -> Result<bool, SignalingError> {
        self.log.lock().push(format!("send:{}", peer_id));
        self.sent.lock().push((peer_id, payload.to_string()));
        Ok(true)
    }

    async fn sign_out(&self) -> Result<(), SignalingError> {
        self.log.lock().push("sign_out".to_string());
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
