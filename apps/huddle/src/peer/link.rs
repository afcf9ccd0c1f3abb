use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    ConnectionState, LinkId, PeerConnection, PeerConnector, PeerEvent, PeerEventSink,
    RemoteStream, RemoteTrack, Role, SessionDescription, SignalingState,
};
use crate::config::CallConfig;
use crate::error::{NegotiationError, SignalingError};
use crate::media::LocalStream;
use crate::signaling::{IceCandidate, SignalingMessage};

/// Outbound half of signaling as seen by one link.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    pub media_ready_grace: Duration,
    pub connect_watchdog: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            media_ready_grace: Duration::from_millis(500),
            connect_watchdog: Duration::from_secs(30),
        }
    }
}

impl From<&CallConfig> for LinkOptions {
    fn from(config: &CallConfig) -> Self {
        Self {
            media_ready_grace: config.media_ready_grace,
            connect_watchdog: config.connect_watchdog,
        }
    }
}

/// Something the owning session should reflect.
#[derive(Debug, Clone)]
pub enum LinkUpdate {
    State(ConnectionState),
    RemoteStream(Arc<RemoteStream>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    /// Held until the remote description is set.
    Queued,
    /// The connection refused it. Logged, never fatal.
    Rejected,
    /// The link is closed.
    Ignored,
}

struct LinkState {
    closed: bool,
    connection: Option<Arc<dyn PeerConnection>>,
    connection_state: ConnectionState,
    pending: VecDeque<IceCandidate>,
    remote_stream: Option<Arc<RemoteStream>>,
    local_offer: Option<String>,
    applied_offer: Option<String>,
    local_candidates: Vec<IceCandidate>,
    watchdog: Option<JoinHandle<()>>,
    watchdog_expired: bool,
}

/// One offer/answer attempt over one peer connection.
///
/// Negotiation steps are serialized by an async lock. `close` does not take
/// that lock: it flips the closed flag, and every step re-checks the flag
/// after each suspension point and bails out with `NegotiationError::Closed`.
pub struct PeerLink {
    id: LinkId,
    role: Role,
    connector: Arc<dyn PeerConnector>,
    sink: Arc<dyn SignalSink>,
    media: watch::Receiver<Option<LocalStream>>,
    events: PeerEventSink,
    options: LinkOptions,
    negotiation: AsyncMutex<()>,
    state: Mutex<LinkState>,
    this: Weak<PeerLink>,
}

impl PeerLink {
    pub fn new(
        role: Role,
        events: PeerEventSink,
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn SignalSink>,
        media: watch::Receiver<Option<LocalStream>>,
        options: LinkOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: events.link_id(),
            role,
            connector,
            sink,
            media,
            events,
            options,
            negotiation: AsyncMutex::new(()),
            state: Mutex::new(LinkState {
                closed: false,
                connection: None,
                connection_state: ConnectionState::New,
                pending: VecDeque::new(),
                remote_stream: None,
                local_offer: None,
                applied_offer: None,
                local_candidates: Vec::new(),
                watchdog: None,
                watchdog_expired: false,
            }),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection_state
    }

    pub fn remote_stream(&self) -> Option<Arc<RemoteStream>> {
        self.state.lock().remote_stream.clone()
    }

    pub fn pending_candidates(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn applied_offer(&self) -> Option<String> {
        self.state.lock().applied_offer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True once the connect watchdog fired without the link reaching
    /// `Connected`. Purely diagnostic.
    pub fn watchdog_expired(&self) -> bool {
        self.state.lock().watchdog_expired
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.state.lock().closed {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.state.lock().connection.clone()
    }

    fn current_media(&self) -> Option<LocalStream> {
        self.media.borrow().clone().filter(LocalStream::is_live)
    }

    async fn wait_for_media(&self) -> Result<LocalStream, NegotiationError> {
        if let Some(stream) = self.current_media() {
            return Ok(stream);
        }
        debug!(link_id = self.id, "local media not ready; waiting once");
        tokio::time::sleep(self.options.media_ready_grace).await;
        self.current_media().ok_or(NegotiationError::MediaNotReady)
    }

    /// Creates the underlying connection on first use and attaches the local
    /// tracks to it.
    async fn ensure_connection(&self) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if let Some(connection) = self.connection() {
            return Ok(connection);
        }
        let stream = self.wait_for_media().await?;
        self.ensure_open()?;

        let connection = self
            .connector
            .connect(self.events.clone())
            .await
            .map_err(|err| NegotiationError::ConnectionFailed(err.to_string()))?;
        for track in stream.tracks() {
            if let Err(err) = connection.add_track(track).await {
                self.discard(connection.as_ref()).await;
                return Err(NegotiationError::Track(err.to_string()));
            }
        }

        let closed = {
            let mut state = self.state.lock();
            if !state.closed {
                state.connection = Some(connection.clone());
                state.watchdog = Some(self.spawn_watchdog());
            }
            state.closed
        };
        if closed {
            self.discard(connection.as_ref()).await;
            return Err(NegotiationError::Closed);
        }
        debug!(
            link_id = self.id,
            role = ?self.role,
            tracks = stream.tracks().len(),
            "peer connection created"
        );
        Ok(connection)
    }

    async fn discard(&self, connection: &dyn PeerConnection) {
        if let Err(err) = connection.close().await {
            warn!(link_id = self.id, error = %err, "error closing peer connection");
        }
    }

    fn spawn_watchdog(&self) -> JoinHandle<()> {
        let this = self.this.clone();
        let timeout = self.options.connect_watchdog;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(link) = this.upgrade() {
                link.on_watchdog(timeout);
            }
        })
    }

    fn on_watchdog(&self, timeout: Duration) {
        let mut state = self.state.lock();
        state.watchdog = None;
        if state.closed || state.connection_state == ConnectionState::Connected {
            return;
        }
        state.watchdog_expired = true;
        warn!(
            link_id = self.id,
            role = ?self.role,
            state = ?state.connection_state,
            timeout_secs = timeout.as_secs(),
            "connection not established before watchdog; still waiting"
        );
    }

    /// Creates the connection, attaches local tracks, and publishes an offer.
    pub async fn begin_as_offerer(&self) -> Result<(), NegotiationError> {
        let _negotiating = self.negotiation.lock().await;
        self.ensure_open()?;
        if self.role != Role::Offerer {
            return Err(NegotiationError::UnexpectedRole("begin_as_offerer"));
        }
        if self.state.lock().local_offer.is_some() {
            debug!(link_id = self.id, "offer already created");
            return Ok(());
        }

        let connection = self.ensure_connection().await?;
        let offer = connection
            .create_offer()
            .await
            .map_err(|err| NegotiationError::Sdp(err.to_string()))?;
        self.ensure_open()?;
        connection
            .set_local_description(offer.clone())
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))?;
        self.ensure_open()?;

        self.state.lock().local_offer = Some(offer.sdp.clone());
        self.sink
            .send(SignalingMessage::Offer { sdp: offer.sdp })
            .await?;
        info!(link_id = self.id, "offer sent");
        Ok(())
    }

    /// Applies a remote offer, answers it, then drains queued candidates.
    pub async fn accept_offer(&self, sdp: String) -> Result<(), NegotiationError> {
        let _negotiating = self.negotiation.lock().await;
        self.ensure_open()?;
        if self.role != Role::Answerer {
            return Err(NegotiationError::UnexpectedRole("accept_offer"));
        }
        if let Some(applied) = self.state.lock().applied_offer.as_deref() {
            if applied == sdp {
                debug!(link_id = self.id, "duplicate offer ignored");
            } else {
                warn!(link_id = self.id, "link already answered a different offer");
            }
            return Ok(());
        }

        let connection = self.ensure_connection().await?;
        connection
            .set_remote_description(SessionDescription::offer(sdp.clone()))
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))?;
        self.ensure_open()?;
        self.state.lock().applied_offer = Some(sdp);

        let answer = connection
            .create_answer()
            .await
            .map_err(|err| NegotiationError::Sdp(err.to_string()))?;
        self.ensure_open()?;
        connection
            .set_local_description(answer.clone())
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))?;
        self.ensure_open()?;

        self.sink
            .send(SignalingMessage::Answer { sdp: answer.sdp })
            .await?;
        info!(link_id = self.id, "answer sent");
        let drained = self.drain_pending(&connection).await;
        debug!(link_id = self.id, drained, "queued candidates drained after offer");
        Ok(())
    }

    /// Applies an answer if, and only if, an offer is outstanding. Returns
    /// whether it was applied.
    pub async fn accept_answer(&self, sdp: String) -> Result<bool, NegotiationError> {
        let _negotiating = self.negotiation.lock().await;
        self.ensure_open()?;
        let Some(connection) = self.connection() else {
            debug!(link_id = self.id, "answer before any offer; ignoring");
            return Ok(false);
        };
        let signaling_state = connection.signaling_state();
        if signaling_state != SignalingState::HaveLocalOffer {
            debug!(
                link_id = self.id,
                state = ?signaling_state,
                "ignoring answer outside have-local-offer"
            );
            return Ok(false);
        }

        connection
            .set_remote_description(SessionDescription::answer(sdp))
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))?;
        self.ensure_open()?;
        info!(link_id = self.id, "answer applied");
        let drained = self.drain_pending(&connection).await;
        debug!(link_id = self.id, drained, "queued candidates drained after answer");
        Ok(true)
    }

    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> CandidateDisposition {
        let _negotiating = self.negotiation.lock().await;
        let connection = {
            let state = self.state.lock();
            if state.closed {
                return CandidateDisposition::Ignored;
            }
            state.connection.clone()
        };
        if let Some(connection) = connection {
            if connection.has_remote_description().await {
                return self.apply_candidate(&connection, candidate).await;
            }
        }

        let mut state = self.state.lock();
        if state.closed {
            return CandidateDisposition::Ignored;
        }
        state.pending.push_back(candidate);
        trace!(
            link_id = self.id,
            queued = state.pending.len(),
            "remote candidate queued until description is set"
        );
        CandidateDisposition::Queued
    }

    async fn apply_candidate(
        &self,
        connection: &Arc<dyn PeerConnection>,
        candidate: IceCandidate,
    ) -> CandidateDisposition {
        let line = candidate.candidate.clone();
        match connection.add_ice_candidate(candidate).await {
            Ok(()) => CandidateDisposition::Applied,
            Err(err) => {
                warn!(
                    link_id = self.id,
                    candidate = %line,
                    error = %err,
                    "failed to apply remote candidate; continuing"
                );
                CandidateDisposition::Rejected
            }
        }
    }

    /// Applies queued candidates in arrival order.
    async fn drain_pending(&self, connection: &Arc<dyn PeerConnection>) -> usize {
        let mut applied = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.closed {
                    break;
                }
                state.pending.pop_front()
            };
            let Some(candidate) = next else {
                break;
            };
            if self.apply_candidate(connection, candidate).await == CandidateDisposition::Applied {
                applied += 1;
            }
        }
        applied
    }

    /// Moves outbound media onto `stream` without renegotiating: existing
    /// senders get the new track, kinds without a sender get one added.
    pub async fn replace_tracks(&self, stream: &LocalStream) -> Result<(), NegotiationError> {
        let _negotiating = self.negotiation.lock().await;
        self.ensure_open()?;
        let Some(connection) = self.connection() else {
            debug!(link_id = self.id, "no connection yet; tracks attach on connect");
            return Ok(());
        };
        let senders = connection.sender_kinds();
        for track in stream.tracks() {
            let result = if senders.contains(&track.kind()) {
                connection.replace_track(track).await
            } else {
                connection.add_track(track).await
            };
            result.map_err(|err| NegotiationError::Track(err.to_string()))?;
            self.ensure_open()?;
        }
        info!(
            link_id = self.id,
            stream_id = stream.id(),
            source = ?stream.source(),
            "outbound tracks replaced"
        );
        Ok(())
    }

    /// Publishes the outstanding offer and the local candidates gathered so far
    /// once more, for a peer that subscribed after they were first sent.
    /// Returns false when there is no offer awaiting an answer.
    pub async fn redeliver_offer(&self) -> Result<bool, NegotiationError> {
        let _negotiating = self.negotiation.lock().await;
        if self.role != Role::Offerer {
            return Ok(false);
        }
        let (connection, offer, candidates) = {
            let state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }
            match (&state.connection, &state.local_offer) {
                (Some(connection), Some(offer)) => (
                    connection.clone(),
                    offer.clone(),
                    state.local_candidates.clone(),
                ),
                _ => return Ok(false),
            }
        };
        if connection.signaling_state() != SignalingState::HaveLocalOffer {
            return Ok(false);
        }

        info!(
            link_id = self.id,
            candidates = candidates.len(),
            "peer ready; redelivering offer"
        );
        self.sink.send(SignalingMessage::Offer { sdp: offer }).await?;
        for candidate in candidates {
            if let Err(err) = self
                .sink
                .send(SignalingMessage::IceCandidate { candidate })
                .await
            {
                warn!(link_id = self.id, error = %err, "failed to redeliver local candidate");
            }
        }
        Ok(true)
    }

    /// Single transition point for everything the connection reports.
    pub async fn apply_event(&self, event: PeerEvent) -> Option<LinkUpdate> {
        if self.is_closed() {
            trace!(link_id = self.id, ?event, "event for closed link dropped");
            return None;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.state.lock().local_candidates.push(candidate.clone());
                if let Err(err) = self
                    .sink
                    .send(SignalingMessage::IceCandidate { candidate })
                    .await
                {
                    warn!(link_id = self.id, error = %err, "failed to send local candidate");
                }
                None
            }
            PeerEvent::ConnectionState(state) => self.transition(state.connection_state()?, "transport"),
            PeerEvent::IceConnectionState(state) => self.transition(state.connection_state()?, "ice"),
            PeerEvent::Track(track) => Some(LinkUpdate::RemoteStream(self.attach_remote_track(track))),
        }
    }

    fn transition(&self, next: ConnectionState, source: &'static str) -> Option<LinkUpdate> {
        let mut state = self.state.lock();
        let previous = state.connection_state;
        let Some(advanced) = previous.advance(next) else {
            trace!(link_id = self.id, from = ?previous, to = ?next, source, "transition ignored");
            return None;
        };
        state.connection_state = advanced;
        if advanced == ConnectionState::Connected || advanced.is_terminal() {
            if let Some(watchdog) = state.watchdog.take() {
                watchdog.abort();
            }
        }
        drop(state);

        if advanced == ConnectionState::Failed {
            warn!(link_id = self.id, role = ?self.role, from = ?previous, source, "peer link failed");
        } else {
            info!(
                link_id = self.id,
                role = ?self.role,
                from = ?previous,
                to = ?advanced,
                source,
                "peer link state changed"
            );
        }
        Some(LinkUpdate::State(advanced))
    }

    /// Builds a fresh remote stream that includes `track`, replacing any
    /// earlier track of the same kind.
    fn attach_remote_track(&self, track: RemoteTrack) -> Arc<RemoteStream> {
        let mut state = self.state.lock();
        let mut tracks: Vec<RemoteTrack> = state
            .remote_stream
            .as_ref()
            .map(|stream| {
                stream
                    .tracks
                    .iter()
                    .filter(|existing| existing.id != track.id && existing.kind != track.kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let id = track.stream_id.clone();
        debug!(link_id = self.id, track_id = %track.id, kind = %track.kind, "remote track arrived");
        tracks.push(track);
        let stream = Arc::new(RemoteStream { id, tracks });
        state.remote_stream = Some(stream.clone());
        stream
    }

    /// Detaches callbacks, then closes the connection and drops queued
    /// candidates and the remote stream. Idempotent.
    pub async fn close(&self) {
        let (connection, watchdog) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.clear();
            state.remote_stream = None;
            (state.connection.take(), state.watchdog.take())
        };
        self.events.detach();
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        if let Some(connection) = connection {
            self.discard(connection.as_ref()).await;
        }
        info!(link_id = self.id, role = ?self.role, "peer link closed");
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if let Some(watchdog) = self.state.get_mut().watchdog.take() {
            watchdog.abort();
        }
    }
}
