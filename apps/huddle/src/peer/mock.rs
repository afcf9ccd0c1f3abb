//! In-memory peer connections for tests. Signaling-state transitions follow
//! the offer/answer rules of a real connection; ICE and media are driven by
//! hand through [`MockPeerConnection::emit`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    PeerConnection, PeerConnector, PeerEvent, PeerEventSink, SdpKind, SessionDescription,
    SignalingState,
};
use crate::error::PeerError;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::IceCandidate;

#[derive(Default)]
struct MockSettings {
    fail_connect: AtomicBool,
    fail_remote_descriptions: AtomicBool,
    fail_candidates: AtomicBool,
}

/// Hands out [`MockPeerConnection`]s and remembers every one it built.
#[derive(Default)]
pub struct MockConnector {
    settings: Arc<MockSettings>,
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
    next_id: AtomicU64,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.settings.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.settings
            .fail_remote_descriptions
            .store(fail, Ordering::SeqCst);
    }

    pub fn fail_candidates(&self, fail: bool) {
        self.settings.fail_candidates.store(fail, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.connections.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if self.settings.fail_connect.load(Ordering::SeqCst) {
            return Err(PeerError::new("connect", "mock connector refused"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = Arc::new(MockPeerConnection {
            id,
            events,
            settings: self.settings.clone(),
            state: Mutex::new(MockState::default()),
            close_count: AtomicUsize::new(0),
        });
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
struct MockState {
    signaling: Option<SignalingState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_sets: usize,
    senders: Vec<MediaTrack>,
    replaced: Vec<TrackKind>,
    applied: Vec<IceCandidate>,
    rejected: usize,
    offers: usize,
    closed: bool,
}

impl MockState {
    fn signaling(&self) -> SignalingState {
        self.signaling.unwrap_or(SignalingState::Stable)
    }
}

pub struct MockPeerConnection {
    id: u64,
    events: PeerEventSink,
    settings: Arc<MockSettings>,
    state: Mutex<MockState>,
    close_count: AtomicUsize,
}

impl MockPeerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fires a callback as the real stack would. Returns false once the
    /// owning link has detached.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.events.emit(event)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn remote_description_sets(&self) -> usize {
        self.state.lock().remote_sets
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn rejected_candidates(&self) -> usize {
        self.state.lock().rejected
    }

    pub fn senders(&self) -> Vec<MediaTrack> {
        self.state.lock().senders.clone()
    }

    pub fn replaced_tracks(&self) -> Vec<TrackKind> {
        self.state.lock().replaced.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn open(&self, operation: &'static str) -> Result<parking_lot::MutexGuard<'_, MockState>, PeerError> {
        let state = self.state.lock();
        if state.closed {
            return Err(PeerError::new(operation, "connection closed"));
        }
        Ok(state)
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.open("add_track")?;
        if state.senders.iter().any(|sender| sender.kind() == track.kind()) {
            return Err(PeerError::new("add_track", format!("{} sender exists", track.kind())));
        }
        state.senders.push(track.clone());
        Ok(())
    }

    async fn replace_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.open("replace_track")?;
        let Some(sender) = state
            .senders
            .iter_mut()
            .find(|sender| sender.kind() == track.kind())
        else {
            return Err(PeerError::new("replace_track", format!("no {} sender", track.kind())));
        };
        *sender = track.clone();
        state.replaced.push(track.kind());
        Ok(())
    }

    fn sender_kinds(&self) -> Vec<TrackKind> {
        self.state.lock().senders.iter().map(MediaTrack::kind).collect()
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.open("create_offer")?;
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "v=0 mock-{} offer-{} tracks={}",
            self.id,
            state.offers,
            state.senders.len()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.open("create_answer")?;
        if state.signaling() != SignalingState::HaveRemoteOffer {
            return Err(PeerError::new("create_answer", "no remote offer"));
        }
        Ok(SessionDescription::answer(format!("v=0 mock-{} answer", self.id)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let mut state = self.open("set_local_description")?;
        let next = match (state.signaling(), description.kind) {
            (SignalingState::Stable | SignalingState::HaveLocalOffer, SdpKind::Offer) => {
                SignalingState::HaveLocalOffer
            }
            (SignalingState::HaveRemoteOffer, SdpKind::Answer) => SignalingState::Stable,
            (current, kind) => {
                return Err(PeerError::new(
                    "set_local_description",
                    format!("{kind:?} not allowed in {current:?}"),
                ));
            }
        };
        state.signaling = Some(next);
        state.local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        if self.settings.fail_remote_descriptions.load(Ordering::SeqCst) {
            return Err(PeerError::new("set_remote_description", "rejected by mock"));
        }
        let mut state = self.open("set_remote_description")?;
        let next = match (state.signaling(), description.kind) {
            (SignalingState::Stable | SignalingState::HaveRemoteOffer, SdpKind::Offer) => {
                SignalingState::HaveRemoteOffer
            }
            (SignalingState::HaveLocalOffer, SdpKind::Answer) => SignalingState::Stable,
            (current, kind) => {
                return Err(PeerError::new(
                    "set_remote_description",
                    format!("{kind:?} not allowed in {current:?}"),
                ));
            }
        };
        state.signaling = Some(next);
        state.remote = Some(description);
        state.remote_sets += 1;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        let state = self.state.lock();
        if state.closed {
            SignalingState::Closed
        } else {
            state.signaling()
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.open("add_ice_candidate")?;
        let refused = self.settings.fail_candidates.load(Ordering::SeqCst)
            || state.remote.is_none()
            || !candidate.candidate.starts_with("candidate:");
        if refused {
            state.rejected += 1;
            return Err(PeerError::new("add_ice_candidate", "candidate refused"));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.closed = true;
        Ok(())
    }
}
