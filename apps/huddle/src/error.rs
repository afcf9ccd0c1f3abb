use std::fmt::Display;

use signal_bus::BusError;
use thiserror::Error;

/// Capture device failures, classified the way the platform reports them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("permission to use the capture device was denied")]
    PermissionDenied,
    #[error("no capture device found")]
    NotFound,
    #[error("capture device is busy or in use by another application")]
    Busy,
    #[error("capture constraints not supported: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("relay failure: {0}")]
    Relay(String),
    #[error("room {0} not found or no longer active")]
    RoomNotFound(String),
    #[error("malformed signaling message: {0}")]
    Malformed(String),
}

impl From<BusError> for SignalingError {
    fn from(err: BusError) -> Self {
        SignalingError::Relay(err.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::Malformed(err.to_string())
    }
}

/// Failure reported by the peer-connection seam.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed: {message}")]
pub struct PeerError {
    pub operation: &'static str,
    pub message: String,
}

impl PeerError {
    pub fn new(operation: &'static str, err: impl Display) -> Self {
        Self {
            operation,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("local media not ready")]
    MediaNotReady,
    #[error("session description failed: {0}")]
    Description(String),
    #[error("sdp creation failed: {0}")]
    Sdp(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("track update failed: {0}")]
    Track(String),
    #[error("{0} is not valid for this link's role")]
    UnexpectedRole(&'static str),
    #[error("peer link closed")]
    Closed,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// The single error value surfaced to the consumer of a call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("relay failure: {0}")]
    Relay(String),
    #[error("room {0} not found or no longer active")]
    RoomNotFound(String),
    #[error(transparent)]
    Negotiation(NegotiationError),
    #[error("invalid call state: {0}")]
    InvalidState(String),
    /// The operation was overtaken by the call ending. Never surfaced as the
    /// session error.
    #[error("call ended while the operation was in flight")]
    Aborted,
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Relay(msg) => CallError::Relay(msg),
            SignalingError::RoomNotFound(room) => CallError::RoomNotFound(room),
            SignalingError::Malformed(msg) => CallError::Relay(msg),
        }
    }
}

impl From<NegotiationError> for CallError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::Closed => CallError::Aborted,
            NegotiationError::Signaling(inner) => inner.into(),
            other => CallError::Negotiation(other),
        }
    }
}

pub type CallResult<T> = Result<T, CallError>;
