//! Peer connection management for WebRTC.
//!
//! Handles the peer connection lifecycle behind the `MediaEngine` boundary.

pub mod engine;
pub mod negotiator;
pub mod webrtc_engine;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::*;
pub use negotiator::*;
pub use webrtc_engine::{WebRtcEngine, WebRtcLocalTrack};
