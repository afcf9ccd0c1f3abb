//! The call coordinator: sequences media, room, and negotiation, and owns the
//! status the consumer sees.

mod coordinator;
mod dispatch;

use std::fmt;
use std::sync::Arc;

use signal_bus::{Bus, RoomDirectory};
use tokio::sync::{broadcast, watch};

use crate::config::CallConfig;
use crate::error::{CallError, CallResult};
use crate::media::{CaptureBackend, DeviceInfo, LocalStream, MediaSource, TrackKind};
use crate::peer::{PeerConnector, PeerLink, RemoteStream, RtcConnector, Role};
use crate::signaling::RoomId;

use coordinator::SessionInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Disconnected => "disconnected",
            CallStatus::Error => "error",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `leave()` was called. The only path that sends a hangup.
    Local,
    /// The peer sent a hangup.
    RemoteHangup,
    /// The consumer went away without leaving.
    Teardown,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    StatusChanged { from: CallStatus, to: CallStatus },
    LocalStream(Option<LocalStream>),
    RemoteStream(Option<Arc<RemoteStream>>),
    Error(CallError),
    Ended { reason: EndReason },
}

/// One two-party call.
///
/// Handles are cheap clones of the same session. Dropping the last handle
/// releases media and closes the link without telling the peer.
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        capture: Arc<dyn CaptureBackend>,
        bus: Arc<dyn Bus>,
        rooms: Arc<dyn RoomDirectory>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner::new(config, capture, bus, rooms, connector)),
        }
    }

    /// A session whose peer connections are real `webrtc` connections.
    pub fn with_webrtc(
        config: CallConfig,
        capture: Arc<dyn CaptureBackend>,
        bus: Arc<dyn Bus>,
        rooms: Arc<dyn RoomDirectory>,
    ) -> Self {
        let connector = Arc::new(RtcConnector::new(&config));
        Self::new(config, capture, bus, rooms, connector)
    }

    /// Acquires the camera, creates a room, and sends the offer.
    pub async fn start(&self) -> CallResult<RoomId> {
        self.inner.start().await
    }

    /// Acquires the camera and joins `room_id`, then answers whatever offer
    /// arrives.
    pub async fn join(&self, room_id: &str) -> CallResult<RoomId> {
        self.inner.join(room_id).await
    }

    /// Ends the call and tells the peer. Returns false if the call had already
    /// ended.
    pub async fn leave(&self) -> bool {
        self.inner.terminate(EndReason::Local).await
    }

    /// Releases everything without a hangup, for a consumer that is going
    /// away mid-call.
    pub async fn teardown(&self) -> bool {
        self.inner.terminate(EndReason::Teardown).await
    }

    /// Returns the new enabled state, or `None` without an audio track.
    pub fn toggle_audio(&self) -> Option<bool> {
        self.inner.media.toggle_track(TrackKind::Audio)
    }

    pub fn toggle_video(&self) -> Option<bool> {
        self.inner.media.toggle_track(TrackKind::Video)
    }

    /// Swaps the outbound video between camera and screen. Returns whether
    /// the screen is now being shared.
    pub async fn toggle_screen_share(&self) -> CallResult<bool> {
        self.inner.toggle_screen_share().await
    }

    /// Discards the current link and sends a fresh offer. Offerer only.
    pub async fn renegotiate(&self) -> CallResult<()> {
        self.inner.renegotiate().await
    }

    pub fn status(&self) -> CallStatus {
        self.inner.status()
    }

    pub fn status_watch(&self) -> watch::Receiver<CallStatus> {
        self.inner.status_watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.subscribe()
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.inner.media.active()
    }

    pub fn remote_stream(&self) -> Option<Arc<RemoteStream>> {
        self.inner.remote_stream()
    }

    pub fn error(&self) -> Option<CallError> {
        self.inner.error()
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.inner.room_id()
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.role()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.inner.is_screen_sharing()
    }

    /// The peer link of the current negotiation attempt.
    pub fn link(&self) -> Option<Arc<PeerLink>> {
        self.inner.current_link()
    }

    pub fn media(&self) -> &MediaSource {
        &self.inner.media
    }

    pub async fn devices(&self) -> Result<Vec<DeviceInfo>, CallError> {
        Ok(self.inner.media.devices().await?)
    }

    pub fn peer_id(&self) -> &str {
        self.inner.signaling.peer_id()
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("peer_id", &self.peer_id())
            .field("status", &self.status())
            .field("room_id", &self.room_id())
            .finish()
    }
}
