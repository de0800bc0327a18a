//! rendezvous-webrtc - WebRTC peer sessions over an HTTP rendezvous server
//!
//! Features:
//! - Long-poll signaling client (sign-in, roster, heartbeat, message relay)
//! - Single-peer offer/answer and ICE negotiation with cancellable attempts
//! - Codec preference rewriting of local SDP
//! - Typed JSON frames over the peer data channel
//!
//! Media runs through the `MediaEngine` trait; `WebRtcEngine` implements it
//! on webrtc-rs.

pub mod config;
pub mod datachannel;
pub mod error;
pub mod ice;
pub mod peer;
pub mod sdp;
pub mod signaling;

pub use config::{ClientConfig, MediaConstraints, NegotiatorConfig, RendezvousConfig, RosterUpdateMode};
pub use datachannel::{DataChannelBridge, Frame, FrameKind};
pub use error::{
    BridgeError, ConfigError, ConnectError, EngineError, MessageError, NegotiationError,
    SignalingError, TransportError,
};
pub use ice::{google_stun_servers, IceServerConfig};
pub use peer::{MediaEngine, NegotiatorEvent, NegotiatorState, SessionNegotiator, WebRtcEngine};
pub use sdp::{prefer_codec, prefer_codecs, MediaKind};
pub use signaling::{
    HttpTransport, HyperTransport, Peer, PeerMessenger, RendezvousClient, SessionState,
    SignalingEvent, SignalingObserver,
};
