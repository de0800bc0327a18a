//! Peer-to-peer messages relayed through the rendezvous server.
//!
//! Session descriptions and application messages carry a `type` field; ICE
//! candidates are untyped objects; a hangup is the bare text `BYE`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MessageError;

/// Body sent to a peer to end the call.
pub const HANGUP: &str = "BYE";

/// `type` value of application messages relayed through the server.
pub const APP_MESSAGE_TYPE: &str = "message";

/// Session description kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
        }
    }
}

/// Session description as exchanged on the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "type": self.sdp_type.as_str(), "sdp": self.sdp }).to_string()
    }
}

/// ICE candidate for signaling
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

impl IceCandidate {
    /// Read the three required fields of an untyped candidate object.
    pub fn from_object(object: &Map<String, Value>) -> Result<Self, MessageError> {
        let sdp_mid = object
            .get("sdpMid")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingField("sdpMid"))?;
        let sdp_mline_index = object
            .get("sdpMLineIndex")
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
            .ok_or(MessageError::MissingField("sdpMLineIndex"))?;
        let candidate = object
            .get("candidate")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingField("candidate"))?;

        Ok(Self {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.to_string(),
            sdp_mline_index,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The `type` of a typed peer message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
    Pranswer,
    Json,
    Other(String),
}

impl DescriptionKind {
    fn parse(kind: &str) -> Self {
        match kind {
            "offer" => DescriptionKind::Offer,
            "answer" => DescriptionKind::Answer,
            "pranswer" => DescriptionKind::Pranswer,
            "json" => DescriptionKind::Json,
            other => DescriptionKind::Other(other.to_string()),
        }
    }

    /// Kinds allowed to create a peer connection on the receiving side.
    pub fn may_open_connection(&self) -> bool {
        matches!(
            self,
            DescriptionKind::Offer | DescriptionKind::Answer | DescriptionKind::Json
        )
    }

    pub fn sdp_type(&self) -> Option<SdpType> {
        match self {
            DescriptionKind::Offer => Some(SdpType::Offer),
            DescriptionKind::Answer => Some(SdpType::Answer),
            DescriptionKind::Pranswer => Some(SdpType::Pranswer),
            _ => None,
        }
    }
}

/// A parsed message from a remote peer.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerMessage {
    /// `{"type": "...", "sdp": "..."}`; `sdp` may be missing.
    Description {
        kind: DescriptionKind,
        sdp: Option<String>,
    },
    /// `{"type": "message", ...}` application payload.
    App(Value),
    /// Untyped object, expected to be an ICE candidate.
    Untyped(Map<String, Value>),
}

impl PeerMessage {
    pub fn parse(body: &str) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| MessageError::NotJson(e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(MessageError::NotObject);
        };

        match object.get("type").and_then(Value::as_str) {
            Some(APP_MESSAGE_TYPE) => Ok(PeerMessage::App(Value::Object(object))),
            Some(kind) => Ok(PeerMessage::Description {
                kind: DescriptionKind::parse(kind),
                sdp: object.get("sdp").and_then(Value::as_str).map(str::to_string),
            }),
            None => Ok(PeerMessage::Untyped(object)),
        }
    }

    pub fn may_open_connection(&self) -> bool {
        match self {
            PeerMessage::Description { kind, .. } => kind.may_open_connection(),
            _ => false,
        }
    }
}
