//! Rendezvous session events and the observer seam.

use async_trait::async_trait;

/// Rendezvous session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NotConnected,
    SigningIn,
    Connected,
    SigningOut,
}

/// Event emitted by the rendezvous client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalingEvent {
    SignedIn,
    Disconnected,
    ServerConnectionFailure(String),
    PeerConnected { id: i64, name: String },
    PeerDisconnected(i64),
    PeerHangup(i64),
    MessageFromPeer { peer_id: i64, body: String },
}

/// Receives rendezvous events in order.
///
/// The long-poll loop awaits every observer before issuing the next `wait`,
/// so an observer sees events strictly in arrival order and may call back
/// into the client (including `sign_out`).
#[async_trait]
pub trait SignalingObserver: Send + Sync {
    async fn on_signaling_event(&self, event: &SignalingEvent);
}
