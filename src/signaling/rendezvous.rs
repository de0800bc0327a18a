//! Rendezvous server client.
//!
//! Speaks the `sign_in / wait / heartbeat / message / sign_out` protocol:
//! 1. `GET /sign_in` returns our id in `Pragma` and the current roster
//! 2. A perpetual `GET /wait` long-poll delivers roster updates (Pragma is
//!    our own id) or messages from other peers (Pragma is the sender)
//! 3. `GET /heartbeat` keeps the registration alive
//! 4. `POST /message` relays a payload to another peer
//! 5. `GET /sign_out` ends the session

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use hyper::Method;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::events::{SessionState, SignalingEvent, SignalingObserver};
use super::message::HANGUP;
use super::roster::{Peer, PeerRoster, RosterChange, UNASSIGNED_PEER_ID, UNKNOWN_PEER_ID};
use super::transport::{HttpTransport, HyperTransport, SignalRequest, SignalResponse};
use crate::config::{RendezvousConfig, RosterUpdateMode};
use crate::error::{ConnectError, SignalingError, TransportError};

/// Body of the 500 response a server sends when the peer we wait on is gone.
pub const PEER_GONE_MARKER: &str = "Peer most likely gone.";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outbound side of the rendezvous session, as seen by the negotiator.
#[async_trait]
pub trait PeerMessenger: Send + Sync {
    /// Relay `payload` to `peer_id`; `Ok(false)` if it was not sent.
    async fn send_to_peer(&self, peer_id: i64, payload: &str) -> Result<bool, SignalingError>;

    /// Leave the rendezvous server.
    async fn sign_out(&self) -> Result<(), SignalingError>;
}

struct Session {
    state: SessionState,
    self_id: i64,
    server: Option<Url>,
    client_name: String,
    roster: PeerRoster,
    cancel: Option<CancellationToken>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::NotConnected,
            self_id: UNASSIGNED_PEER_ID,
            server: None,
            client_name: String::new(),
            roster: PeerRoster::new(),
            cancel: None,
        }
    }

    fn reset(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.state = SessionState::NotConnected;
        self.self_id = UNASSIGNED_PEER_ID;
        self.roster.clear();
    }
}

struct Inner {
    transport: Arc<dyn HttpTransport>,
    config: RendezvousConfig,
    authorization: RwLock<Option<String>>,
    session: Mutex<Session>,
    observers: Mutex<Vec<Weak<dyn SignalingObserver>>>,
    events: broadcast::Sender<SignalingEvent>,
    heartbeat_ms: watch::Sender<i64>,
}

/// Client for an HTTP rendezvous server.
///
/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct RendezvousClient {
    inner: Arc<Inner>,
}

impl RendezvousClient {
    /// Create a client that talks to the server over hyper.
    pub fn new(config: RendezvousConfig) -> Self {
        Self::with_transport(config, Arc::new(HyperTransport::new()))
    }

    /// Create a client on top of a custom transport.
    pub fn with_transport(config: RendezvousConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (heartbeat_ms, _) = watch::channel(config.heartbeat_interval_ms);
        Self {
            inner: Arc::new(Inner {
                transport,
                authorization: RwLock::new(config.authorization.clone()),
                config,
                session: Mutex::new(Session::new()),
                observers: Mutex::new(Vec::new()),
                events,
                heartbeat_ms,
            }),
        }
    }

    /// Register an observer. Only a weak reference is kept.
    pub fn add_observer<O: SignalingObserver + 'static>(&self, observer: &Arc<O>) {
        let weak: Weak<O> = Arc::downgrade(observer);
        let weak: Weak<dyn SignalingObserver> = weak;
        self.inner.observers.lock().push(weak);
    }

    /// Subscribe to a copy of every event.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Our server-assigned id, -1 until signed in.
    pub fn self_id(&self) -> i64 {
        self.inner.session.lock().self_id
    }

    /// Name used for the current or last sign-in.
    pub fn client_name(&self) -> String {
        self.inner.session.lock().client_name.clone()
    }

    /// Known remote peers in ascending id order.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.session.lock().roster.peers()
    }

    /// Replace the `Authorization` header sent with subsequent requests.
    pub fn set_authorization(&self, authorization: Option<String>) {
        *self.inner.authorization.write() = authorization;
    }

    pub fn authorization(&self) -> Option<String> {
        self.inner.authorization.read().clone()
    }

    /// Change the heartbeat period; `ms <= 0` disables heartbeats.
    pub fn set_heartbeat_interval_ms(&self, ms: i64) {
        self.inner.heartbeat_ms.send_replace(ms);
    }

    pub fn heartbeat_interval_ms(&self) -> i64 {
        *self.inner.heartbeat_ms.borrow()
    }

    /// Sign in to `server_url` as `client_name`.
    ///
    /// Any failure is also reported as `ServerConnectionFailure`.
    pub async fn connect(&self, server_url: &str, client_name: &str) -> Result<(), ConnectError> {
        match self.sign_in(server_url, client_name).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Failed to sign in to {}: {}", server_url, e);
                self.emit(SignalingEvent::ServerConnectionFailure(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Sign out and tear the session down.
    ///
    /// Returns immediately when there is no session. The session is torn
    /// down even when the request fails; the failure is still returned.
    pub async fn sign_out(&self) -> Result<(), SignalingError> {
        let (server, self_id) = {
            let mut session = self.inner.session.lock();
            match session.state {
                SessionState::NotConnected | SessionState::SigningOut => return Ok(()),
                SessionState::SigningIn => return Err(SignalingError::SignInInProgress),
                SessionState::Connected => {}
            }
            session.state = SessionState::SigningOut;
            if let Some(token) = session.cancel.take() {
                token.cancel();
            }
            (session.server.clone(), session.self_id)
        };

        let result = match server {
            Some(server) if self_id != UNASSIGNED_PEER_ID => {
                self.request_sign_out(&server, self_id).await
            }
            _ => Ok(()),
        };
        if let Err(ref e) = result {
            warn!("Sign-out request failed: {}", e);
        }

        self.inner.session.lock().reset();
        info!("Signed out of rendezvous server");
        self.emit(SignalingEvent::Disconnected).await;
        result
    }

    /// Relay a text payload to another peer.
    ///
    /// Returns `Ok(false)` without touching the network when not connected
    /// or when `peer_id` is ourselves or unassigned.
    pub async fn send_to_peer(&self, peer_id: i64, payload: &str) -> Result<bool, SignalingError> {
        let Some((server, self_id)) = self.connected_identity() else {
            return Ok(false);
        };
        if peer_id < 0 || peer_id == self_id {
            return Ok(false);
        }

        let url = endpoint(
            &server,
            "message",
            &[("peer_id", self_id.to_string()), ("to", peer_id.to_string())],
        )?;
        let request = SignalRequest::get(url, self.inner.config.request_timeout())
            .with_method(Method::POST)
            .with_body(payload);

        let response = self.execute(request).await?;
        if !response.is_ok() {
            warn!("Message to peer {} rejected with status {}", peer_id, response.status);
            return Ok(false);
        }
        Ok(true)
    }

    /// Relay a JSON payload to another peer.
    pub async fn send_json_to_peer(
        &self,
        peer_id: i64,
        payload: &serde_json::Value,
    ) -> Result<bool, SignalingError> {
        self.send_to_peer(peer_id, &payload.to_string()).await
    }

    /// Report remaining capacity to the server. Advisory only.
    pub async fn update_capacity(&self, value: i64) -> Result<bool, SignalingError> {
        let Some((server, self_id)) = self.connected_identity() else {
            return Ok(false);
        };

        let url = endpoint(
            &server,
            "capacity",
            &[("peer_id", self_id.to_string()), ("value", value.to_string())],
        )?;
        let request = SignalRequest::get(url, self.inner.config.request_timeout())
            .with_method(Method::PUT);

        match self.execute(request).await {
            Ok(response) if response.is_ok() => Ok(true),
            Ok(response) => {
                warn!("Capacity update rejected with status {}", response.status);
                Ok(false)
            }
            Err(e) => {
                warn!("Capacity update failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn sign_in(&self, server_url: &str, client_name: &str) -> Result<(), ConnectError> {
        let server = self.begin_sign_in(server_url, client_name)?;

        let (self_id, roster_body) = match self.request_sign_in(&server, client_name).await {
            Ok(result) => result,
            Err(e) => {
                self.inner.session.lock().reset();
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        let changes = {
            let mut session = self.inner.session.lock();
            session.self_id = self_id;
            session.state = SessionState::Connected;
            session.cancel = Some(token.clone());
            session.roster.apply_snapshot(&roster_body, self_id)
        };

        info!("Signed in to {} as '{}' (id {})", server, client_name, self_id);

        for change in changes {
            self.emit(change.into()).await;
        }
        self.emit(SignalingEvent::SignedIn).await;

        tokio::spawn(self.clone().heartbeat_loop(token.clone()));
        tokio::spawn(self.clone().long_poll_loop(token));

        Ok(())
    }

    fn begin_sign_in(&self, server_url: &str, client_name: &str) -> Result<Url, ConnectError> {
        let mut session = self.inner.session.lock();
        if session.state != SessionState::NotConnected {
            return Err(ConnectError::AlreadyConnected);
        }
        if client_name.trim().is_empty() {
            return Err(ConnectError::EmptyClientName);
        }

        let mut server = Url::parse(server_url)
            .map_err(|e| ConnectError::InvalidServerUrl(format!("{}: {}", server_url, e)))?;
        if server.cannot_be_a_base() {
            return Err(ConnectError::InvalidServerUrl(server_url.to_string()));
        }
        if !server.path().ends_with('/') {
            let path = format!("{}/", server.path());
            server.set_path(&path);
        }

        session.state = SessionState::SigningIn;
        session.server = Some(server.clone());
        session.client_name = client_name.to_string();
        Ok(server)
    }

    async fn request_sign_in(
        &self,
        server: &Url,
        client_name: &str,
    ) -> Result<(i64, String), ConnectError> {
        let url = endpoint(server, "sign_in", &[("peer_name", client_name.to_string())])
            .map_err(|e| ConnectError::InvalidServerUrl(e.to_string()))?;
        let response = self
            .execute(SignalRequest::get(url, self.inner.config.request_timeout()))
            .await?;

        if !response.is_ok() {
            return Err(ConnectError::Rejected(response.status));
        }
        let self_id = response
            .pragma_id()
            .filter(|id| *id >= 0)
            .ok_or(ConnectError::MissingPeerId)?;

        Ok((self_id, response.body))
    }

    async fn request_sign_out(&self, server: &Url, self_id: i64) -> Result<(), SignalingError> {
        let url = endpoint(server, "sign_out", &[("peer_id", self_id.to_string())])?;
        let response = self
            .execute(SignalRequest::get(url, self.inner.config.request_timeout()))
            .await?;
        if !response.is_ok() {
            warn!("Sign-out answered with status {}", response.status);
        }
        Ok(())
    }

    async fn execute(&self, request: SignalRequest) -> Result<SignalResponse, TransportError> {
        let authorization = self.inner.authorization.read().clone();
        self.inner
            .transport
            .execute(request.with_authorization(authorization))
            .await
    }

    fn connected_identity(&self) -> Option<(Url, i64)> {
        let session = self.inner.session.lock();
        if session.state != SessionState::Connected {
            return None;
        }
        session.server.clone().map(|server| (server, session.self_id))
    }

    /// Deliver an event to subscribers, then to every live observer in turn.
    async fn emit(&self, event: SignalingEvent) {
        let _ = self.inner.events.send(event.clone());

        let observers: Vec<Arc<dyn SignalingObserver>> = {
            let mut list = self.inner.observers.lock();
            list.retain(|o| o.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.on_signaling_event(&event).await;
        }
    }

    /// End a session whose long-poll hit a fatal error.
    async fn abandon_session(&self, token: &CancellationToken, reason: &str) {
        {
            let mut session = self.inner.session.lock();
            if token.is_cancelled() || session.state != SessionState::Connected {
                return;
            }
            session.reset();
        }
        error!("Rendezvous session lost: {}", reason);
        self.emit(SignalingEvent::Disconnected).await;
    }

    async fn heartbeat_loop(self, token: CancellationToken) {
        let mut interval_rx = self.inner.heartbeat_ms.subscribe();
        loop {
            let interval_ms = *interval_rx.borrow_and_update();
            if interval_ms <= 0 {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = interval_rx.changed() => if changed.is_err() { break },
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = self.send_heartbeat() => {}
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(interval_ms as u64)) => {}
                changed = interval_rx.changed() => if changed.is_err() { break },
            }
        }
        debug!("Heartbeat loop finished");
    }

    async fn send_heartbeat(&self) {
        let Some((server, self_id)) = self.connected_identity() else {
            return;
        };
        let url = match endpoint(&server, "heartbeat", &[("peer_id", self_id.to_string())]) {
            Ok(url) => url,
            Err(e) => {
                warn!("Heartbeat skipped: {}", e);
                return;
            }
        };

        match self
            .execute(SignalRequest::get(url, self.inner.config.request_timeout()))
            .await
        {
            Ok(response) if response.is_ok() => debug!("Heartbeat sent"),
            Ok(response) => warn!("Heartbeat answered with status {}", response.status),
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }

    async fn long_poll_loop(self, token: CancellationToken) {
        let max_failures = self.inner.config.max_consecutive_poll_failures.max(1);
        let mut failures = 0u32;

        loop {
            if token.is_cancelled() {
                break;
            }
            let Some((server, self_id)) = self.connected_identity() else {
                break;
            };
            let url = match endpoint(&server, "wait", &[("peer_id", self_id.to_string())]) {
                Ok(url) => url,
                Err(e) => {
                    self.abandon_session(&token, &e.to_string()).await;
                    break;
                }
            };
            let request = SignalRequest::get(url, self.inner.config.long_poll_timeout());

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                result = self.execute(request) => result,
            };

            match result {
                Ok(response) if response.is_ok() => {
                    failures = 0;
                    self.dispatch_wait_response(response, self_id).await;
                }
                Ok(response) if response.status == 408 || response.status == 504 => {
                    debug!("Long-poll expired on the server, re-issuing");
                }
                Ok(response) => {
                    if response.status == 500 && response.body.contains(PEER_GONE_MARKER) {
                        info!("Peer most likely gone, closing peer connection");
                        self.emit(SignalingEvent::PeerDisconnected(UNKNOWN_PEER_ID))
                            .await;
                    }
                    let reason = format!("wait answered with status {}", response.status);
                    self.abandon_session(&token, &reason).await;
                    break;
                }
                Err(TransportError::Timeout) => {
                    debug!("Long-poll timed out, re-issuing");
                }
                Err(e) => {
                    failures += 1;
                    warn!("Long-poll failed ({}/{}): {}", failures, max_failures, e);
                    if failures >= max_failures {
                        self.abandon_session(&token, &e.to_string()).await;
                        break;
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.inner.config.poll_retry_delay()) => {}
                    }
                }
            }
        }
        debug!("Long-poll loop finished");
    }

    async fn dispatch_wait_response(&self, response: SignalResponse, self_id: i64) {
        let Some(sender_id) = response.pragma_id() else {
            warn!("Dropping wait response without a peer id");
            return;
        };

        if sender_id == self_id {
            let changes = {
                let mut session = self.inner.session.lock();
                match self.inner.config.roster_updates {
                    RosterUpdateMode::Snapshot => {
                        session.roster.apply_snapshot(&response.body, self_id)
                    }
                    RosterUpdateMode::Incremental => {
                        session.roster.apply_incremental(&response.body, self_id)
                    }
                }
            };
            for change in changes {
                self.emit(change.into()).await;
            }
        } else if response.body.trim() == HANGUP {
            self.inner.session.lock().roster.remove(sender_id);
            info!("Peer {} hung up", sender_id);
            self.emit(SignalingEvent::PeerHangup(sender_id)).await;
        } else {
            self.emit(SignalingEvent::MessageFromPeer {
                peer_id: sender_id,
                body: response.body,
            })
            .await;
        }
    }
}

#[async_trait]
impl PeerMessenger for RendezvousClient {
    async fn send_to_peer(&self, peer_id: i64, payload: &str) -> Result<bool, SignalingError> {
        RendezvousClient::send_to_peer(self, peer_id, payload).await
    }

    async fn sign_out(&self) -> Result<(), SignalingError> {
        RendezvousClient::sign_out(self).await
    }
}

impl From<RosterChange> for SignalingEvent {
    fn from(change: RosterChange) -> Self {
        match change {
            RosterChange::Connected(peer) => SignalingEvent::PeerConnected {
                id: peer.id,
                name: peer.name,
            },
            RosterChange::Disconnected(id) => SignalingEvent::PeerDisconnected(id),
        }
    }
}

/// Build `<server><path>?<query>`.
fn endpoint(server: &Url, path: &str, query: &[(&str, String)]) -> Result<Url, SignalingError> {
    let mut url = server
        .join(path)
        .map_err(|e| SignalingError::Url(e.to_string()))?;
    url.query_pairs_mut()
        .clear()
        .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::super::transport::testing::ScriptedTransport;
    use super::*;

    const SERVER: &str = "http://rendezvous.test:8888";

    fn test_config() -> RendezvousConfig {
        RendezvousConfig {
            heartbeat_interval_ms: 0,
            poll_retry_delay_ms: 10,
            ..Default::default()
        }
    }

    fn client_with(config: RendezvousConfig) -> (RendezvousClient, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::new();
        let client = RendezvousClient::with_transport(config, transport.clone());
        (client, transport)
    }

    async fn next_event(rx: &mut broadcast::Receiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn wait_from(sender: i64, body: &str) -> Result<SignalResponse, TransportError> {
        Ok(SignalResponse::new(200, Some(&sender.to_string()), body))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Observer that signs out as soon as any peer message arrives.
    struct SignOutOnMessage {
        client: RendezvousClient,
        seen: Mutex<Vec<SignalingEvent>>,
    }

    #[async_trait]
    impl SignalingObserver for SignOutOnMessage {
        async fn on_signaling_event(&self, event: &SignalingEvent) {
            self.seen.lock().push(event.clone());
            if matches!(event, SignalingEvent::MessageFromPeer { .. }) {
                self.client.sign_out().await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_sign_out_when_not_connected_is_noop() {
        let (client, transport) = client_with(test_config());
        client.sign_out().await.unwrap();
        assert!(transport.requests().is_empty());
        assert_eq!(client.state(), SessionState::NotConnected);
    }

    #[tokio::test]
    async fn test_connect_emits_roster_then_signed_in() {
        let (client, transport) = client_with(test_config());
        let mut rx = client.subscribe();
        transport.script_sign_in(1, "A,1,1\nB,2,1\n");

        client.connect(SERVER, "A").await.unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            SignalingEvent::PeerConnected {
                id: 2,
                name: "B".to_string()
            }
        );
        assert_eq!(next_event(&mut rx).await, SignalingEvent::SignedIn);
        assert_eq!(client.self_id(), 1);
        assert!(client.is_connected());
        assert_eq!(client.peers(), vec![Peer::new(2, "B")]);

        let sign_in = &transport.requests_to("/sign_in")[0];
        assert_eq!(sign_in.query("peer_name").as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_connect_rejected_reports_failure() {
        let (client, transport) = client_with(test_config());
        let mut rx = client.subscribe();
        transport.script("/sign_in", Ok(SignalResponse::new(503, None, "busy")));

        let result = client.connect(SERVER, "A").await;

        assert_eq!(result, Err(ConnectError::Rejected(503)));
        assert!(matches!(
            next_event(&mut rx).await,
            SignalingEvent::ServerConnectionFailure(_)
        ));
        assert_eq!(client.state(), SessionState::NotConnected);
        assert_eq!(client.self_id(), UNASSIGNED_PEER_ID);
    }

    #[tokio::test]
    async fn test_connect_without_pragma_fails() {
        let (client, transport) = client_with(test_config());
        transport.script("/sign_in", Ok(SignalResponse::new(200, None, "A,1,1")));
        assert_eq!(
            client.connect(SERVER, "A").await,
            Err(ConnectError::MissingPeerId)
        );
        assert_eq!(client.state(), SessionState::NotConnected);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (client, transport) = client_with(test_config());
        transport.script_sign_in(1, "A,1,1");
        client.connect(SERVER, "A").await.unwrap();

        let mut rx = client.subscribe();
        assert_eq!(
            client.connect(SERVER, "A").await,
            Err(ConnectError::AlreadyConnected)
        );
        assert!(matches!(
            next_event(&mut rx).await,
            SignalingEvent::ServerConnectionFailure(_)
        ));
        assert!(client.is_connected());
        assert_eq!(transport.requests_to("/sign_in").len(), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_input() {
        let (client, transport) = client_with(test_config());
        assert!(matches!(
            client.connect("not a url", "A").await,
            Err(ConnectError::InvalidServerUrl(_))
        ));
        assert_eq!(
            client.connect(SERVER, "  ").await,
            Err(ConnectError::EmptyClientName)
        );
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_send_to_peer_fails_fast() {
        let (client, transport) = client_with(test_config());
        assert_eq!(client.send_to_peer(2, "hello").await, Ok(false));

        transport.script_sign_in(1, "A,1,1\nB,2,1");
        client.connect(SERVER, "A").await.unwrap();
        assert_eq!(client.send_to_peer(1, "to myself").await, Ok(false));
        assert_eq!(client.send_to_peer(UNASSIGNED_PEER_ID, "nobody").await, Ok(false));
        assert!(transport.requests_to("/message").is_empty());
    }

    #[tokio::test]
    async fn test_send_to_peer_posts_message() {
        let (client, transport) = client_with(test_config());
        transport.script_sign_in(1, "A,1,1\nB,2,1");
        client.connect(SERVER, "A").await.unwrap();

        assert_eq!(client.send_to_peer(2, "hello").await, Ok(true));

        let sent = &transport.requests_to("/message")[0];
        assert_eq!(sent.method, Method::POST);
        assert_eq!(sent.query("peer_id").as_deref(), Some("1"));
        assert_eq!(sent.query("to").as_deref(), Some("2"));
        assert_eq!(sent.body.as_deref(), Some("hello"));

        transport.script("/message", Ok(SignalResponse::new(404, None, "")));
        assert_eq!(client.send_to_peer(2, "again").await, Ok(false));

        transport.script("/message", Err(TransportError::Timeout));
        assert_eq!(
            client.send_to_peer(2, "late").await,
            Err(SignalingError::Transport(TransportError::Timeout))
        );
    }

    #[tokio::test]
    async fn test_long_poll_dispatch() {
        let (client, transport) = client_with(test_config());
        let mut rx = client.subscribe();
        transport.script_sign_in(1, "A,1,1");
        client.connect(SERVER, "A").await.unwrap();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::SignedIn);

        transport.push_wait(wait_from(1, "A,1,1\nB,2,1"));
        assert_eq!(
            next_event(&mut rx).await,
            SignalingEvent::PeerConnected {
                id: 2,
                name: "B".to_string()
            }
        );

        transport.push_wait(wait_from(2, r#"{"type":"offer","sdp":"v=0"}"#));
        assert_eq!(
            next_event(&mut rx).await,
            SignalingEvent::MessageFromPeer {
                peer_id: 2,
                body: r#"{"type":"offer","sdp":"v=0"}"#.to_string()
            }
        );

        transport.push_wait(wait_from(2, "BYE"));
        assert_eq!(next_event(&mut rx).await, SignalingEvent::PeerHangup(2));
        assert!(client.peers().is_empty());

        let waits = transport.requests_to("/wait");
        assert!(waits.len() >= 3);
        assert!(waits.iter().all(|w| w.query("peer_id").as_deref() == Some("1")));
    }

    #[tokio::test]
    async fn test_long_poll_survives_timeouts() {
        let (client, transport) = client_with(test_config());
        let mut rx = client.subscribe();
        transport.script_sign_in(1, "A,1,1");
        client.connect(SERVER, "A").await.unwrap();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::SignedIn);

        for _ in 0..5 {
            transport.push_wait(Err(TransportError::Timeout));
        }
        transport.push_wait(Ok(SignalResponse::new(504, None, "")));
        transport.push_wait(wait_from(3, "ping"));

        assert_eq!(
            next_event(&mut rx).await,
            SignalingEvent::MessageFromPeer {
                peer_id: 3,
                body: "ping".to_string()
            }
        );
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_peer_gone_reports_sentinel_and_ends_session() {
        let (client, transport) = client_with(test_config());
        let mut rx = client.subscribe();
        transport.script_sign_in(1, "A,1,1\nB,2,1");
        client.connect(SERVER, "A").await.unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        transport.push_wait(Ok(SignalResponse::new(
            500,
            None,
            "Peer most likely gone.",
        )));

        assert_eq!(
            next_event(&mut rx).await,
            SignalingEvent::PeerDisconnected(UNKNOWN_PEER_ID)
        );
        assert_eq!(next_event(&mut rx).await, SignalingEvent::Disconnected);
        assert_eq!(client.state(), SessionState::NotConnected);
        assert!(client.peers().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_transport_failures_end_session() {
        let (client, transport) = client_with(test_config());
        let mut rx = client.subscribe();
        transport.script_sign_in(1, "A,1,1");
        client.connect(SERVER, "A").await.unwrap();
        assert_eq!(next_event(&mut rx).await, SignalingEvent::SignedIn);

        for _ in 0..3 {
            transport.push_wait(Err(TransportError::Http("connection reset".to_string())));
        }

        assert_eq!(next_event(&mut rx).await, SignalingEvent::Disconnected);
        assert_eq!(client.state(), SessionState::NotConnected);

        // A fresh connect works after the loop gave up
        transport.script_sign_in(4, "A,4,1");
        client.connect(SERVER, "A").await.unwrap();
        assert_eq!(client.self_id(), 4);
    }

    #[tokio::test]
    async fn test_sign_out_tears_down_session() {
        let (client, transport) = client_with(test_config());
        let mut rx = client.subscribe();
        transport.script_sign_in(7, "A,7,1\nB,2,1");
        client.connect(SERVER, "A").await.unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        transport.script("/sign_out", Ok(SignalResponse::new(500, None, "")));
        client.sign_out().await.unwrap();

        assert_eq!(next_event(&mut rx).await, SignalingEvent::Disconnected);
        assert_eq!(client.state(), SessionState::NotConnected);
        assert_eq!(client.self_id(), UNASSIGNED_PEER_ID);
        assert!(client.peers().is_empty());
        let sign_out = &transport.requests_to("/sign_out")[0];
        assert_eq!(sign_out.query("peer_id").as_deref(), Some("7"));

        // Second sign-out is a no-op
        client.sign_out().await.unwrap();
        assert_eq!(transport.requests_to("/sign_out").len(), 1);
    }

    #[tokio::test]
    async fn test_observer_may_sign_out_from_callback() {
        let (client, transport) = client_with(test_config());
        let observer = Arc::new(SignOutOnMessage {
            client: client.clone(),
            seen: Mutex::new(Vec::new()),
        });
        client.add_observer(&observer);
        transport.script_sign_in(1, "A,1,1");
        client.connect(SERVER, "A").await.unwrap();

        transport.push_wait(wait_from(2, "anything"));

        eventually(|| client.state() == SessionState::NotConnected).await;
        eventually(|| observer.seen.lock().contains(&SignalingEvent::Disconnected)).await;
        assert_eq!(transport.requests_to("/sign_out").len(), 1);
    }

    #[tokio::test]
    async fn test_authorization_header_on_every_request() {
        let config = RendezvousConfig {
            authorization: Some("Bearer abc".to_string()),
            ..test_config()
        };
        let (client, transport) = client_with(config);
        transport.script_sign_in(1, "A,1,1\nB,2,1");
        client.connect(SERVER, "A").await.unwrap();
        client.send_to_peer(2, "x").await.unwrap();

        client.set_authorization(Some("Basic xyz".to_string()));
        client.update_capacity(3).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer abc"));
        let message = &transport.requests_to("/message")[0];
        assert_eq!(message.authorization.as_deref(), Some("Bearer abc"));
        let capacity = &transport.requests_to("/capacity")[0];
        assert_eq!(capacity.authorization.as_deref(), Some("Basic xyz"));
    }

    #[tokio::test]
    async fn test_update_capacity() {
        let (client, transport) = client_with(test_config());
        assert_eq!(client.update_capacity(2).await, Ok(false));

        transport.script_sign_in(1, "A,1,1");
        client.connect(SERVER, "A").await.unwrap();
        assert_eq!(client.update_capacity(2).await, Ok(true));

        let capacity = &transport.requests_to("/capacity")[0];
        assert_eq!(capacity.method, Method::PUT);
        assert_eq!(capacity.query("value").as_deref(), Some("2"));

        transport.script("/capacity", Err(TransportError::Timeout));
        assert_eq!(client.update_capacity(1).await, Ok(false));
    }

    #[tokio::test]
    async fn test_heartbeat_interval() {
        let config = RendezvousConfig {
            heartbeat_interval_ms: 20,
            ..test_config()
        };
        let (client, transport) = client_with(config);
        transport.script_sign_in(1, "A,1,1");
        client.connect(SERVER, "A").await.unwrap();

        eventually(|| transport.requests_to("/heartbeat").len() >= 2).await;
        let beat = &transport.requests_to("/heartbeat")[0];
        assert_eq!(beat.query("peer_id").as_deref(), Some("1"));

        client.set_heartbeat_interval_ms(0);
        assert_eq!(client.heartbeat_interval_ms(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = transport.requests_to("/heartbeat").len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.requests_to("/heartbeat").len(), settled);
    }

    #[tokio::test]
    async fn test_heartbeat_disabled() {
        let (client, transport) = client_with(test_config());
        transport.script_sign_in(1, "A,1,1");
        client.connect(SERVER, "A").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.requests_to("/heartbeat").is_empty());
    }

    #[tokio::test]
    async fn test_incremental_roster_mode() {
        let config = RendezvousConfig {
            roster_updates: RosterUpdateMode::Incremental,
            ..test_config()
        };
        let (client, transport) = client_with(config);
        let mut rx = client.subscribe();
        transport.script_sign_in(1, "A,1,1\nB,2,1");
        client.connect(SERVER, "A").await.unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        transport.push_wait(wait_from(1, "C,3,1"));
        assert_eq!(
            next_event(&mut rx).await,
            SignalingEvent::PeerConnected {
                id: 3,
                name: "C".to_string()
            }
        );
        transport.push_wait(wait_from(1, "B,2,0"));
        assert_eq!(next_event(&mut rx).await, SignalingEvent::PeerDisconnected(2));
        assert_eq!(client.peers(), vec![Peer::new(3, "C")]);
    }

    #[test]
    fn test_endpoint_building() {
        let server = Url::parse("http://host:8888/prefix/").unwrap();
        let url = endpoint(
            &server,
            "message",
            &[("peer_id", "1".to_string()), ("to", "2".to_string())],
        )
        .unwrap();
        assert_eq!(url.as_str(), "http://host:8888/prefix/message?peer_id=1&to=2");

        let named = endpoint(&server, "sign_in", &[("peer_name", "a b&c".to_string())]).unwrap();
        assert_eq!(named.query_pairs().next().unwrap().1, "a b&c");
    }
}
