//! HTTP rendezvous signaling.
//!
//! The rendezvous server only introduces peers and relays their messages;
//! media flows peer to peer once the negotiator has exchanged descriptions.

pub mod events;
pub mod message;
pub mod rendezvous;
pub mod roster;
pub mod transport;

pub use events::{SessionState, SignalingEvent, SignalingObserver};
pub use message::{IceCandidate, PeerMessage, SdpType, SessionDescription, HANGUP};
pub use rendezvous::{PeerMessenger, RendezvousClient};
pub use roster::{Peer, PeerRoster, UNASSIGNED_PEER_ID, UNKNOWN_PEER_ID};
pub use transport::{HttpTransport, HyperTransport, SignalRequest, SignalResponse};
