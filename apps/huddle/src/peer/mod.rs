//! Peer-connection negotiation: the offer/answer/ICE state machine and the
//! seam to the underlying WebRTC stack.

mod link;
pub mod mock;
mod rtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::error::PeerError;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::IceCandidate;

pub use link::{CandidateDisposition, LinkOptions, LinkUpdate, PeerLink, SignalSink};
pub use rtc::{RtcConnector, RtcPeerConnection};

pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// Connectivity of one link, folded from transport and ICE callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    /// The state reached by applying `next`, or `None` if the transition is not
    /// allowed. Terminal states absorb everything.
    pub fn advance(self, next: ConnectionState) -> Option<ConnectionState> {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected | Failed, _) => None,
            (current, next) if current == next => None,
            (_, Failed) => Some(Failed),
            (Connecting | Connected, Disconnected) => Some(Disconnected),
            (New, Connecting) => Some(Connecting),
            (New | Connecting, Connected) => Some(Connected),
            _ => None,
        }
    }
}

/// Peer connection state as the transport reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn connection_state(self) -> Option<ConnectionState> {
        match self {
            TransportState::New => None,
            TransportState::Connecting => Some(ConnectionState::Connecting),
            TransportState::Connected => Some(ConnectionState::Connected),
            TransportState::Disconnected | TransportState::Closed => {
                Some(ConnectionState::Disconnected)
            }
            TransportState::Failed => Some(ConnectionState::Failed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// ICE disconnects are often transient, so only the transport state may
    /// move a link to `Disconnected`.
    pub fn connection_state(self) -> Option<ConnectionState> {
        match self {
            IceState::Checking => Some(ConnectionState::Connecting),
            IceState::Connected | IceState::Completed => Some(ConnectionState::Connected),
            IceState::Failed => Some(ConnectionState::Failed),
            IceState::New | IceState::Disconnected | IceState::Closed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Inbound RTP source when backed by a real connection.
    pub rtc: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Inbound media from the peer. A new value is built whenever a track
/// arrives; existing values are never mutated.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn track(&self, kind: TrackKind) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(TransportState),
    IceConnectionState(IceState),
    Track(RemoteTrack),
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub link: LinkId,
    pub event: PeerEvent,
}

/// Where a connection's callbacks go. Detaching makes every later callback a
/// no-op, which is how a closed link stays inert.
#[derive(Clone)]
pub struct PeerEventSink {
    link: LinkId,
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>>,
}

impl PeerEventSink {
    pub fn new(link: LinkId, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            link,
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn link_id(&self) -> LinkId {
        self.link
    }

    pub fn emit(&self, event: PeerEvent) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx
                .send(LinkEvent {
                    link: self.link,
                    event,
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn detach(&self) {
        self.tx.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.tx.lock().is_some()
    }
}

/// One underlying peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;

    /// Swaps the track on the existing outbound sender of the same kind.
    async fn replace_track(&self, track: &MediaTrack) -> Result<(), PeerError>;

    /// Kinds that already have an outbound sender.
    fn sender_kinds(&self) -> Vec<TrackKind>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Builds connections whose callbacks feed `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
