use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::SignalingError;

/// ICE candidate in the JSON shape browsers produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
    Hangup,
    /// Sent by a joiner once it is listening, so an offer published before it
    /// subscribed can be delivered again.
    Ready,
}

impl SignalingMessage {
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalingMessage::Offer { .. } => SignalType::Offer,
            SignalingMessage::Answer { .. } => SignalType::Answer,
            SignalingMessage::IceCandidate { .. } => SignalType::IceCandidate,
            SignalingMessage::Hangup => SignalType::Hangup,
            SignalingMessage::Ready => SignalType::Ready,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    Hangup,
    Ready,
}

/// SDP as `{type, sdp}` (what browsers send) or a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SdpField {
    Description {
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        sdp: String,
    },
    Raw(String),
}

impl SdpField {
    fn into_sdp(self) -> String {
        match self {
            SdpField::Description { sdp, .. } | SdpField::Raw(sdp) => sdp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SdpField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

/// One relayed signaling record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub room_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(default)]
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn new(room_id: &str, sender_id: &str, message: &SignalingMessage) -> Self {
        let description = |kind: &str, sdp: &str| SdpField::Description {
            kind: Some(kind.to_owned()),
            sdp: sdp.to_owned(),
        };
        let payload = match message {
            SignalingMessage::Offer { sdp } => SignalPayload {
                sdp: Some(description("offer", sdp)),
                candidate: None,
            },
            SignalingMessage::Answer { sdp } => SignalPayload {
                sdp: Some(description("answer", sdp)),
                candidate: None,
            },
            SignalingMessage::IceCandidate { candidate } => SignalPayload {
                sdp: None,
                candidate: Some(candidate.clone()),
            },
            SignalingMessage::Hangup | SignalingMessage::Ready => SignalPayload::default(),
        };
        Self {
            id: Some(uuid::Uuid::new_v4().to_string()),
            room_id: room_id.to_owned(),
            sender_id: sender_id.to_owned(),
            signal_type: message.signal_type(),
            payload,
        }
    }

    pub fn message(&self) -> Result<SignalingMessage, SignalingError> {
        let missing = |field: &str| {
            SignalingError::Malformed(format!("{:?} without {field}", self.signal_type))
        };
        match self.signal_type {
            SignalType::Offer => Ok(SignalingMessage::Offer {
                sdp: self.payload.sdp.clone().ok_or_else(|| missing("sdp"))?.into_sdp(),
            }),
            SignalType::Answer => Ok(SignalingMessage::Answer {
                sdp: self.payload.sdp.clone().ok_or_else(|| missing("sdp"))?.into_sdp(),
            }),
            SignalType::IceCandidate => Ok(SignalingMessage::IceCandidate {
                candidate: self
                    .payload
                    .candidate
                    .clone()
                    .ok_or_else(|| missing("candidate"))?,
            }),
            SignalType::Hangup => Ok(SignalingMessage::Hangup),
            SignalType::Ready => Ok(SignalingMessage::Ready),
        }
    }

    pub fn encode(&self) -> Result<Bytes, SignalingError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, SignalingError> {
        Ok(serde_json::from_slice(raw)?)
    }
}
