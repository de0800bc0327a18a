//! Typed frames over the peer data channel.
//!
//! Every frame is a JSON object with a `type` field. Outbound payloads that
//! are already JSON objects are sent as they are; anything else travels as
//! `{"data": "<payload>"}`.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::peer::negotiator::{NegotiatorEvent, SessionNegotiator};
use crate::signaling::rendezvous::PeerMessenger;
use crate::signaling::roster::UNASSIGNED_PEER_ID;

/// Frame `type` values understood by the rendering server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Message,
    CameraTransformLookAt,
    CameraTransform,
    StereoRendering,
    KeyboardEvent,
    MouseEvent,
    Other(String),
}

impl FrameKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "message" => FrameKind::Message,
            "camera-transform-lookat" => FrameKind::CameraTransformLookAt,
            "camera-transform" => FrameKind::CameraTransform,
            "stereo-rendering" => FrameKind::StereoRendering,
            "keyboard-event" => FrameKind::KeyboardEvent,
            "mouse-event" => FrameKind::MouseEvent,
            other => FrameKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FrameKind::Message => "message",
            FrameKind::CameraTransformLookAt => "camera-transform-lookat",
            FrameKind::CameraTransform => "camera-transform",
            FrameKind::StereoRendering => "stereo-rendering",
            FrameKind::KeyboardEvent => "keyboard-event",
            FrameKind::MouseEvent => "mouse-event",
            FrameKind::Other(kind) => kind,
        }
    }
}

/// A received frame
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// `None` when the frame carried no string `type`
    pub kind: Option<FrameKind>,
    pub body: Map<String, Value>,
}

impl Frame {
    /// The `data` field of wrapped payloads.
    pub fn data(&self) -> Option<&Value> {
        self.body.get("data")
    }
}

/// Build the wire text for `payload` tagged with `kind`.
pub fn frame(kind: &FrameKind, payload: &str) -> String {
    let mut body = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(object)) => object,
        _ => {
            let mut wrapped = Map::new();
            wrapped.insert("data".to_string(), Value::String(payload.to_string()));
            wrapped
        }
    };
    body.insert("type".to_string(), Value::String(kind.as_str().to_string()));
    Value::Object(body).to_string()
}

/// Parse received wire text into a frame.
pub fn unframe(text: &str) -> Result<Frame, BridgeError> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => frame_from_value(value),
        Err(e) => Err(BridgeError::MalformedFrame(e.to_string())),
    }
}

fn frame_from_value(value: Value) -> Result<Frame, BridgeError> {
    let Value::Object(body) = value else {
        return Err(BridgeError::MalformedFrame("not a JSON object".to_string()));
    };
    let kind = body.get("type").and_then(Value::as_str).map(FrameKind::parse);
    Ok(Frame { kind, body })
}

/// Callback invoked for a received frame
pub type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Sends and dispatches typed frames for the negotiated peer.
pub struct DataChannelBridge {
    negotiator: Arc<SessionNegotiator>,
    messenger: Arc<dyn PeerMessenger>,
    handlers: RwLock<HashMap<FrameKind, FrameHandler>>,
    fallback: RwLock<Option<FrameHandler>>,
}

impl DataChannelBridge {
    pub fn new(negotiator: Arc<SessionNegotiator>, messenger: Arc<dyn PeerMessenger>) -> Self {
        Self {
            negotiator,
            messenger,
            handlers: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
        }
    }

    /// Register the handler for frames of `kind`, replacing any previous one.
    pub fn on_frame<F>(&self, kind: FrameKind, handler: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.handlers.write().insert(kind, Arc::new(handler));
    }

    /// Register the handler for frames with an unknown or missing type.
    pub fn on_unhandled<F>(&self, handler: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        *self.fallback.write() = Some(Arc::new(handler));
    }

    /// Send a frame over the peer data channel.
    pub async fn send(&self, kind: &FrameKind, payload: &str) -> Result<(), BridgeError> {
        self.negotiator
            .send_data_channel_message(&frame(kind, payload))
            .await?;
        Ok(())
    }

    /// Send a `message` frame through the rendezvous relay instead.
    pub async fn send_via_signaling(&self, payload: &str) -> Result<(), BridgeError> {
        let peer_id = self.negotiator.active_peer_id();
        if peer_id == UNASSIGNED_PEER_ID {
            return Err(BridgeError::NoActivePeer);
        }
        if !self
            .messenger
            .send_to_peer(peer_id, &frame(&FrameKind::Message, payload))
            .await?
        {
            return Err(BridgeError::RelayRefused);
        }
        Ok(())
    }

    /// Dispatch received wire text. Returns false if it was dropped.
    pub fn dispatch(&self, text: &str) -> bool {
        match unframe(text) {
            Ok(frame) => self.dispatch_frame(&frame),
            Err(e) => {
                warn!("Dropping data channel frame: {}", e);
                false
            }
        }
    }

    fn dispatch_frame(&self, frame: &Frame) -> bool {
        let handler = match &frame.kind {
            Some(kind) => self.handlers.read().get(kind).cloned(),
            None => None,
        };
        let handler = handler.or_else(|| self.fallback.read().clone());

        match handler {
            Some(handler) => {
                handler(frame);
                true
            }
            None => {
                debug!("No handler for frame type {:?}", frame.kind);
                false
            }
        }
    }

    /// Dispatch data channel and relayed frames until `shutdown` is cancelled
    /// or `events` closes.
    pub async fn pump(
        &self,
        mut events: broadcast::Receiver<NegotiatorEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => received,
            };
            match received {
                Ok(NegotiatorEvent::DataChannelMessage { label, text }) => {
                    debug!("Frame on '{}'", label);
                    self.dispatch(&text);
                }
                Ok(NegotiatorEvent::PeerMessage { body, .. }) => match frame_from_value(body) {
                    Ok(frame) => {
                        self.dispatch_frame(&frame);
                    }
                    Err(e) => warn!("Dropping relayed frame: {}", e),
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Frame pump lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
