//! Error types for signaling, negotiation and the media engine boundary.

use thiserror::Error;

/// Failures of a single HTTP exchange with the rendezvous server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("failed to build request: {0}")]
    InvalidRequest(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

/// Reasons a sign-in attempt can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("already connected to the rendezvous server")]
    AlreadyConnected,

    #[error("invalid server URL '{0}'")]
    InvalidServerUrl(String),

    #[error("client name must not be empty")]
    EmptyClientName,

    #[error("sign-in rejected with status {0}")]
    Rejected(u16),

    #[error("sign-in response carried no peer id")]
    MissingPeerId,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from an established rendezvous session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("sign-in still in progress")]
    SignInInProgress,

    #[error("failed to build endpoint URL: {0}")]
    Url(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Protocol errors for peer messages relayed through the server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message is not valid JSON: {0}")]
    NotJson(String),

    #[error("message is not a JSON object")]
    NotObject,

    #[error("missing or invalid field '{0}'")]
    MissingField(&'static str),
}

/// Errors reported by the media engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to create peer connection: {0}")]
    PeerConnection(String),

    #[error("session description error: {0}")]
    SessionDescription(String),

    #[error("failed to add ICE candidate: {0}")]
    IceCandidate(String),

    #[error("local media unavailable: {0}")]
    Media(String),

    #[error("data channel error: {0}")]
    DataChannel(String),

    #[error("failed to close peer connection: {0}")]
    Close(String),
}

/// Errors from the session negotiator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("a connection attempt is already in flight")]
    AttemptInFlight,

    #[error("a peer connection already exists")]
    PeerConnectionExists,

    #[error("no active peer")]
    NoActivePeer,

    #[error("invalid peer id {0}")]
    InvalidPeerId(i64),

    #[error("connection attempt cancelled")]
    Cancelled,

    #[error("no data channel open")]
    NoDataChannel,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Errors from data channel framing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("no data channel available")]
    NoChannel,

    #[error("no active peer to relay the frame to")]
    NoActivePeer,

    #[error("relay through the rendezvous server was refused")]
    RelayRefused,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Negotiation(NegotiationError),
}

impl From<NegotiationError> for BridgeError {
    fn from(e: NegotiationError) -> Self {
        match e {
            NegotiationError::NoDataChannel => BridgeError::NoChannel,
            NegotiationError::NoActivePeer => BridgeError::NoActivePeer,
            NegotiationError::Engine(e) => BridgeError::Engine(e),
            NegotiationError::Signaling(e) => BridgeError::Signaling(e),
            other => BridgeError::Negotiation(other),
        }
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
