//! Peer connection negotiation.
//!
//! Drives offer/answer and ICE exchange for one peer connection at a time,
//! with the rendezvous server as the relay. Everything that touches the
//! peer connection runs under the media lock.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::{
    DataChannel, EngineEvent, LocalMediaStream, MediaEngine, MediaRequest, PeerConnectionConfig,
    PeerConnectionHandle, PeerConnectionState, RemoteTrack, TrackKind,
};
use crate::config::NegotiatorConfig;
use crate::error::{EngineError, NegotiationError};
use crate::ice::IceServerConfig;
use crate::sdp;
use crate::signaling::events::{SignalingEvent, SignalingObserver};
use crate::signaling::message::{IceCandidate, PeerMessage, SdpType, SessionDescription, HANGUP};
use crate::signaling::rendezvous::PeerMessenger;
use crate::signaling::roster::{Peer, UNASSIGNED_PEER_ID, UNKNOWN_PEER_ID};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Negotiator lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiatorState {
    Idle,
    Connecting,
    Active,
    Closing,
}

/// Event emitted by the negotiator
#[derive(Clone, Debug, PartialEq)]
pub enum NegotiatorEvent {
    PeerConnectionCreated { peer_id: i64 },
    PeerConnectionClosed { peer_id: i64 },
    /// The previous connection is gone and a new one may be opened.
    ReadyToConnect,
    RemoteTrackAdded(RemoteTrack),
    RemoteTrackRemoved(RemoteTrack),
    DataChannelOpened { label: String },
    DataChannelMessage { label: String, text: String },
    /// Application message relayed through the rendezvous server.
    PeerMessage { peer_id: i64, body: Value },
    ConnectionHealth(PeerConnectionState),
}

#[derive(Default)]
struct MediaSession {
    pc: Option<Arc<dyn PeerConnectionHandle>>,
    local_stream: Option<LocalMediaStream>,
    pump: Option<JoinHandle<()>>,
    session_id: Option<String>,
    local_description_set: bool,
    remote_description_set: bool,
}

#[derive(Default)]
struct Channels {
    send: Option<Arc<dyn DataChannel>>,
    receive: Option<Arc<dyn DataChannel>>,
}

struct ConnectAttempt {
    id: u64,
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Clears the attempt slot and signals completion when the attempt ends.
struct AttemptGuard<'a> {
    slot: &'a Mutex<Option<ConnectAttempt>>,
    id: u64,
    token: CancellationToken,
    done: watch::Sender<bool>,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        {
            let mut slot = self.slot.lock();
            if slot.as_ref().map(|a| a.id) == Some(self.id) {
                *slot = None;
            }
        }
        self.done.send_replace(true);
    }
}

/// A peer connection with media and send channel, not yet installed.
struct PreparedConnection {
    pc: Arc<dyn PeerConnectionHandle>,
    stream: LocalMediaStream,
    send_channel: Arc<dyn DataChannel>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
}

/// Run an engine call unless the attempt is cancelled first.
async fn checkpoint<T>(
    token: &CancellationToken,
    call: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, NegotiationError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(NegotiationError::Cancelled),
        result = call => result.map_err(NegotiationError::from),
    }
}

/// Close a connection that never got installed.
async fn discard(pc: &Arc<dyn PeerConnectionHandle>, stream: Option<&LocalMediaStream>) {
    if let Some(stream) = stream {
        stream.stop();
    }
    if let Err(e) = pc.close().await {
        warn!("Failed to close discarded peer connection: {}", e);
    }
}

/// Negotiates a single peer connection over the rendezvous relay.
pub struct SessionNegotiator {
    engine: Arc<dyn MediaEngine>,
    messenger: Arc<dyn PeerMessenger>,
    config: RwLock<NegotiatorConfig>,
    media: AsyncMutex<MediaSession>,
    channels: Arc<Mutex<Channels>>,
    active_peer_id: Arc<AtomicI64>,
    state: Mutex<NegotiatorState>,
    attempt: Mutex<Option<ConnectAttempt>>,
    next_attempt: AtomicU64,
    events: broadcast::Sender<NegotiatorEvent>,
    health_stats: Arc<AtomicBool>,
    video_enabled: AtomicBool,
    microphone_muted: AtomicBool,
}

impl SessionNegotiator {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        messenger: Arc<dyn PeerMessenger>,
        config: NegotiatorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            engine,
            messenger,
            health_stats: Arc::new(AtomicBool::new(config.connection_health_stats)),
            config: RwLock::new(config),
            media: AsyncMutex::new(MediaSession::default()),
            channels: Arc::new(Mutex::new(Channels::default())),
            active_peer_id: Arc::new(AtomicI64::new(UNASSIGNED_PEER_ID)),
            state: Mutex::new(NegotiatorState::Idle),
            attempt: Mutex::new(None),
            next_attempt: AtomicU64::new(1),
            events,
            video_enabled: AtomicBool::new(true),
            microphone_muted: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NegotiatorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> NegotiatorState {
        *self.state.lock()
    }

    /// Peer the current connection belongs to, -1 when there is none.
    pub fn active_peer_id(&self) -> i64 {
        self.active_peer_id.load(Ordering::SeqCst)
    }

    pub async fn has_peer_connection(&self) -> bool {
        self.media.lock().await.pc.is_some()
    }

    /// Session id from the local description's `o=` line.
    pub async fn session_id(&self) -> Option<String> {
        self.media.lock().await.session_id.clone()
    }

    pub fn config(&self) -> NegotiatorConfig {
        self.config.read().clone()
    }

    /// ICE servers used by the next peer connection.
    pub fn configure_ice_servers(&self, servers: Vec<IceServerConfig>) {
        self.config.write().ice_servers = servers;
    }

    /// Codecs moved to the front of the next offers and answers.
    pub fn set_preferred_codecs(&self, audio: Option<String>, video: Option<String>) {
        let mut config = self.config.write();
        config.preferred_audio_codec = audio;
        config.preferred_video_codec = video;
    }

    pub fn set_connection_health_stats_enabled(&self, enabled: bool) {
        self.health_stats.store(enabled, Ordering::SeqCst);
    }

    pub async fn set_local_video_enabled(&self, enabled: bool) {
        let media = self.media.lock().await;
        self.video_enabled.store(enabled, Ordering::SeqCst);
        if let Some(stream) = &media.local_stream {
            stream.set_enabled(TrackKind::Video, enabled);
        }
    }

    pub async fn set_microphone_muted(&self, muted: bool) {
        let media = self.media.lock().await;
        self.microphone_muted.store(muted, Ordering::SeqCst);
        if let Some(stream) = &media.local_stream {
            stream.set_enabled(TrackKind::Audio, !muted);
        }
    }

    /// Send text over the outbound data channel.
    pub async fn send_data_channel_message(&self, text: &str) -> Result<(), NegotiationError> {
        let channel = self.channels.lock().send.clone();
        let channel = channel.ok_or(NegotiationError::NoDataChannel)?;
        channel.send_text(text).await?;
        Ok(())
    }

    /// Open a peer connection to `peer` and send it an offer.
    pub async fn connect_to_peer(&self, peer: &Peer) -> Result<(), NegotiationError> {
        if peer.id < 0 {
            return Err(NegotiationError::InvalidPeerId(peer.id));
        }
        let guard = self.begin_attempt()?;
        let token = guard.token.clone();

        let mut media = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(NegotiationError::Cancelled),
            media = self.media.lock() => media,
        };
        if media.pc.is_some() {
            return Err(NegotiationError::PeerConnectionExists);
        }

        info!("Connecting to peer {} ({})", peer.id, peer.name);
        let prepared = match self.build_connection(&token).await {
            Ok(prepared) => prepared,
            Err(NegotiationError::Cancelled) => {
                info!("Connection attempt to peer {} cancelled", peer.id);
                return Err(NegotiationError::Cancelled);
            }
            Err(e) => {
                error!("Failed to create peer connection: {}", e);
                return Err(e);
            }
        };
        let pc = prepared.pc.clone();
        self.install(&mut media, prepared, peer.id);

        if let Err(e) = self.send_offer(&mut media, &pc, peer.id).await {
            error!("Failed to send offer to peer {}: {}", peer.id, e);
            self.close_locked(&mut media).await;
            return Err(e);
        }
        Ok(())
    }

    /// Cancel an in-flight `connect_to_peer` and wait until it has settled.
    ///
    /// Returns false when no attempt was in flight.
    pub async fn cancel_connecting_to_peer(&self) -> bool {
        let (token, mut done) = {
            let slot = self.attempt.lock();
            match slot.as_ref() {
                Some(attempt) => (attempt.token.clone(), attempt.done.clone()),
                None => return false,
            }
        };

        token.cancel();
        loop {
            if *done.borrow_and_update() {
                break;
            }
            if done.changed().await.is_err() {
                break;
            }
        }
        true
    }

    /// Send `BYE` to the active peer, then close the connection.
    pub async fn disconnect_from_peer(&self) -> Result<(), NegotiationError> {
        let peer_id = self.active_peer_id();
        if peer_id == UNASSIGNED_PEER_ID {
            self.close_peer_connection().await;
            return Err(NegotiationError::NoActivePeer);
        }

        match self.messenger.send_to_peer(peer_id, HANGUP).await {
            Ok(true) => debug!("Sent hangup to peer {}", peer_id),
            Ok(false) => warn!("Hangup to peer {} was not delivered", peer_id),
            Err(e) => warn!("Failed to send hangup to peer {}: {}", peer_id, e),
        }
        self.close_peer_connection().await;
        Ok(())
    }

    /// Tear the current peer connection down. False if there was none.
    pub async fn close_peer_connection(&self) -> bool {
        let mut media = self.media.lock().await;
        self.close_locked(&mut media).await
    }

    /// Handle a message relayed from `peer_id`.
    pub async fn handle_peer_message(&self, peer_id: i64, body: &str) {
        if self.is_unexpected_peer(peer_id) {
            return;
        }

        let message = match PeerMessage::parse(body) {
            Ok(PeerMessage::App(value)) => {
                self.emit(NegotiatorEvent::PeerMessage {
                    peer_id,
                    body: value,
                });
                return;
            }
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping message from peer {}: {}", peer_id, e);
                return;
            }
        };

        let mut media = self.media.lock().await;
        // An outbound connect may have bound another peer while we waited
        if self.is_unexpected_peer(peer_id) {
            return;
        }
        if media.pc.is_none() {
            if !message.may_open_connection() {
                debug!("No peer connection, dropping message from peer {}", peer_id);
                return;
            }
            if let Err(e) = self.open_inbound(&mut media, peer_id).await {
                error!("Failed to create peer connection for peer {}: {}", peer_id, e);
                drop(media);
                if let Err(e) = self.messenger.sign_out().await {
                    warn!("Sign-out after failed peer connection failed: {}", e);
                }
                return;
            }
        }
        let Some(pc) = media.pc.clone() else {
            return;
        };

        match message {
            PeerMessage::Description { kind, sdp } => {
                let Some(sdp) = sdp else {
                    warn!("Dropping {:?} from peer {} without sdp", kind, peer_id);
                    return;
                };
                let Some(sdp_type) = kind.sdp_type() else {
                    debug!("Ignoring {:?} message from peer {}", kind, peer_id);
                    return;
                };
                if let Err(e) = self
                    .apply_remote_description(&mut media, &pc, peer_id, sdp_type, sdp)
                    .await
                {
                    error!("Failed to apply {} from peer {}: {}", sdp_type.as_str(), peer_id, e);
                }
            }
            PeerMessage::Untyped(object) => {
                let candidate = match IceCandidate::from_object(&object) {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        warn!("Dropping ICE candidate from peer {}: {}", peer_id, e);
                        return;
                    }
                };
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    warn!("{}", e);
                }
            }
            PeerMessage::App(_) => {}
        }
    }

    fn is_unexpected_peer(&self, peer_id: i64) -> bool {
        let active = self.active_peer_id();
        if active != UNASSIGNED_PEER_ID && peer_id != active {
            error!(
                "Received a message from peer {} while connected to peer {}",
                peer_id, active
            );
            return true;
        }
        false
    }

    fn begin_attempt(&self) -> Result<AttemptGuard<'_>, NegotiationError> {
        let mut slot = self.attempt.lock();
        if slot.is_some() {
            return Err(NegotiationError::AttemptInFlight);
        }

        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        *slot = Some(ConnectAttempt {
            id,
            token: token.clone(),
            done: done_rx,
        });

        Ok(AttemptGuard {
            slot: &self.attempt,
            id,
            token,
            done: done_tx,
        })
    }

    /// Create a peer connection with local media and the send channel.
    ///
    /// Anything created before a failure or cancellation is discarded.
    async fn build_connection(
        &self,
        token: &CancellationToken,
    ) -> Result<PreparedConnection, NegotiationError> {
        let config = self.config.read().clone();
        let pc_config = PeerConnectionConfig {
            ice_servers: config.ice_servers.clone(),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pc = checkpoint(token, self.engine.create_peer_connection(&pc_config, events_tx)).await?;
        if token.is_cancelled() {
            discard(&pc, None).await;
            return Err(NegotiationError::Cancelled);
        }

        let request = MediaRequest {
            constraints: config.media.clone(),
            video_codec: config.preferred_video_codec.clone(),
        };
        let stream = match checkpoint(token, self.engine.get_user_media(&request)).await {
            Ok(stream) => stream,
            Err(e) => {
                discard(&pc, None).await;
                return Err(e);
            }
        };
        stream.set_enabled(TrackKind::Video, self.video_enabled.load(Ordering::SeqCst));
        stream.set_enabled(TrackKind::Audio, !self.microphone_muted.load(Ordering::SeqCst));

        if token.is_cancelled() {
            discard(&pc, Some(&stream)).await;
            return Err(NegotiationError::Cancelled);
        }

        if let Err(e) = checkpoint(token, pc.add_stream(&stream)).await {
            discard(&pc, Some(&stream)).await;
            return Err(e);
        }

        let send_channel =
            match checkpoint(token, pc.create_data_channel(&config.data_channel_label)).await {
                Ok(channel) => channel,
                Err(e) => {
                    discard(&pc, Some(&stream)).await;
                    return Err(e);
                }
            };

        Ok(PreparedConnection {
            pc,
            stream,
            send_channel,
            events: events_rx,
        })
    }

    fn install(&self, media: &mut MediaSession, prepared: PreparedConnection, peer_id: i64) {
        self.channels.lock().send = Some(prepared.send_channel);
        self.active_peer_id.store(peer_id, Ordering::SeqCst);
        media.pump = Some(self.spawn_pump(prepared.events));
        media.pc = Some(prepared.pc);
        media.local_stream = Some(prepared.stream);
        media.session_id = None;
        media.local_description_set = false;
        media.remote_description_set = false;
        *self.state.lock() = NegotiatorState::Connecting;

        info!("Peer connection created for peer {}", peer_id);
        self.emit(NegotiatorEvent::PeerConnectionCreated { peer_id });
    }

    async fn open_inbound(&self, media: &mut MediaSession, peer_id: i64) -> Result<(), NegotiationError> {
        // Inbound connections are not cancellable
        let token = CancellationToken::new();
        let prepared = self.build_connection(&token).await?;
        self.install(media, prepared, peer_id);
        Ok(())
    }

    async fn send_offer(
        &self,
        media: &mut MediaSession,
        pc: &Arc<dyn PeerConnectionHandle>,
        peer_id: i64,
    ) -> Result<(), NegotiationError> {
        let offer = self.with_codec_preferences(pc.create_offer().await?);
        pc.set_local_description(offer.clone()).await?;
        media.local_description_set = true;
        media.session_id = sdp::session_id(&offer.sdp);
        self.send_description(peer_id, &offer).await
    }

    async fn apply_remote_description(
        &self,
        media: &mut MediaSession,
        pc: &Arc<dyn PeerConnectionHandle>,
        peer_id: i64,
        sdp_type: SdpType,
        sdp: String,
    ) -> Result<(), NegotiationError> {
        pc.set_remote_description(SessionDescription::new(sdp_type, sdp))
            .await?;
        media.remote_description_set = true;

        if sdp_type == SdpType::Offer {
            let answer = self.with_codec_preferences(pc.create_answer().await?);
            pc.set_local_description(answer.clone()).await?;
            media.local_description_set = true;
            media.session_id = sdp::session_id(&answer.sdp);
            self.send_description(peer_id, &answer).await?;
        }

        if media.local_description_set && media.remote_description_set {
            let mut state = self.state.lock();
            if *state == NegotiatorState::Connecting {
                *state = NegotiatorState::Active;
                info!("Negotiation with peer {} complete", peer_id);
            }
        }
        Ok(())
    }

    fn with_codec_preferences(&self, description: SessionDescription) -> SessionDescription {
        let config = self.config.read();
        let sdp = sdp::prefer_codecs(
            &description.sdp,
            config.preferred_audio_codec.as_deref(),
            config.preferred_video_codec.as_deref(),
        );
        SessionDescription::new(description.sdp_type, sdp)
    }

    async fn send_description(
        &self,
        peer_id: i64,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        if !self
            .messenger
            .send_to_peer(peer_id, &description.to_json())
            .await?
        {
            warn!(
                "Rendezvous server did not relay {} to peer {}",
                description.sdp_type.as_str(),
                peer_id
            );
        }
        Ok(())
    }

    async fn close_locked(&self, media: &mut MediaSession) -> bool {
        let Some(pc) = media.pc.take() else {
            return false;
        };
        *self.state.lock() = NegotiatorState::Closing;

        let peer_id = self.active_peer_id.swap(UNASSIGNED_PEER_ID, Ordering::SeqCst);

        if let Some(stream) = media.local_stream.take() {
            stream.stop();
        }

        let (send, receive) = {
            let mut channels = self.channels.lock();
            (channels.send.take(), channels.receive.take())
        };
        for channel in send.into_iter().chain(receive) {
            if let Err(e) = channel.close().await {
                warn!("{}", e);
            }
        }

        self.emit(NegotiatorEvent::PeerConnectionClosed { peer_id });

        if let Some(pump) = media.pump.take() {
            pump.abort();
        }
        if let Err(e) = pc.close().await {
            warn!("{}", e);
        }

        media.session_id = None;
        media.local_description_set = false;
        media.remote_description_set = false;

        *self.state.lock() = NegotiatorState::Idle;
        info!("Peer connection to peer {} closed", peer_id);
        self.emit(NegotiatorEvent::ReadyToConnect);
        true
    }

    fn emit(&self, event: NegotiatorEvent) {
        let _ = self.events.send(event);
    }

    fn spawn_pump(&self, mut events: mpsc::UnboundedReceiver<EngineEvent>) -> JoinHandle<()> {
        let pump = EventPump {
            messenger: self.messenger.clone(),
            active_peer_id: self.active_peer_id.clone(),
            channels: self.channels.clone(),
            events: self.events.clone(),
            health_stats: self.health_stats.clone(),
        };
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                pump.handle(event).await;
            }
        })
    }
}

/// Forwards engine callbacks for one peer connection.
struct EventPump {
    messenger: Arc<dyn PeerMessenger>,
    active_peer_id: Arc<AtomicI64>,
    channels: Arc<Mutex<Channels>>,
    events: broadcast::Sender<NegotiatorEvent>,
    health_stats: Arc<AtomicBool>,
}

impl EventPump {
    async fn handle(&self, event: EngineEvent) {
        match event {
            EngineEvent::IceCandidate(candidate) => {
                let peer_id = self.active_peer_id.load(Ordering::SeqCst);
                if peer_id == UNASSIGNED_PEER_ID {
                    debug!("Dropping local ICE candidate, no active peer");
                    return;
                }
                match self.messenger.send_to_peer(peer_id, &candidate.to_json()).await {
                    Ok(true) => {}
                    Ok(false) => warn!("ICE candidate to peer {} was not relayed", peer_id),
                    Err(e) => warn!("Failed to send ICE candidate to peer {}: {}", peer_id, e),
                }
            }
            EngineEvent::RemoteTrackAdded(track) => {
                let _ = self.events.send(NegotiatorEvent::RemoteTrackAdded(track));
            }
            EngineEvent::RemoteTrackRemoved(track) => {
                let _ = self.events.send(NegotiatorEvent::RemoteTrackRemoved(track));
            }
            EngineEvent::DataChannelOpened(channel) => {
                let label = channel.label();
                self.channels.lock().receive = Some(channel);
                let _ = self.events.send(NegotiatorEvent::DataChannelOpened { label });
            }
            EngineEvent::DataChannelMessage { label, text } => {
                let _ = self
                    .events
                    .send(NegotiatorEvent::DataChannelMessage { label, text });
            }
            EngineEvent::ConnectionStateChanged(state) => {
                debug!("Peer connection state changed to {:?}", state);
                if self.health_stats.load(Ordering::SeqCst) {
                    let _ = self.events.send(NegotiatorEvent::ConnectionHealth(state));
                }
            }
        }
    }
}

#[async_trait]
impl SignalingObserver for SessionNegotiator {
    async fn on_signaling_event(&self, event: &SignalingEvent) {
        match event {
            SignalingEvent::MessageFromPeer { peer_id, body } => {
                self.handle_peer_message(*peer_id, body).await;
            }
            SignalingEvent::PeerHangup(id) | SignalingEvent::PeerDisconnected(id) => {
                let active = self.active_peer_id();
                // Id 0 is the server's "peer gone" sentinel and may collide with a real id
                if active != UNASSIGNED_PEER_ID && (*id == active || *id == UNKNOWN_PEER_ID) {
                    info!("Peer {} left, closing peer connection", id);
                    self.close_peer_connection().await;
                }
            }
            SignalingEvent::Disconnected => {
                self.close_peer_connection().await;
            }
            _ => {}
        }
    }
}
