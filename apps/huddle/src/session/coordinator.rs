use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use signal_bus::{Bus, RoomDirectory};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::dispatch::{self, RoomSink};
use super::{CallEvent, CallStatus, EndReason};
use crate::config::CallConfig;
use crate::error::{CallError, CallResult, NegotiationError};
use crate::media::{CaptureBackend, CaptureKind, LocalStream, MediaSource, TrackKind};
use crate::peer::{
    ConnectionState, LinkEvent, LinkId, LinkOptions, LinkUpdate, PeerConnector, PeerEventSink,
    PeerLink, RemoteStream, Role,
};
use crate::signaling::{RoomId, SignalingChannel, SignalingMessage, Subscription};

const EVENT_CAPACITY: usize = 64;

/// Everything that belongs to one call attempt.
#[derive(Default)]
struct CallResources {
    room_id: Option<RoomId>,
    link: Option<Arc<PeerLink>>,
    link_events: Option<mpsc::UnboundedSender<LinkEvent>>,
    subscription: Option<Subscription>,
    dispatcher: Option<JoinHandle<()>>,
    screen_watch: Option<JoinHandle<()>>,
}

impl CallResources {
    /// Stops listening and closes the link. The dispatcher is only aborted
    /// when `abort_dispatcher` is set; the dispatcher itself passes false.
    async fn dispose(self, abort_dispatcher: bool) {
        if let Some(subscription) = &self.subscription {
            subscription.unsubscribe();
        }
        if let Some(watch) = self.screen_watch {
            watch.abort();
        }
        if abort_dispatcher {
            if let Some(dispatcher) = self.dispatcher {
                dispatcher.abort();
            }
        }
        if let Some(link) = self.link {
            link.close().await;
        }
    }
}

struct SessionState {
    /// Bumped by every `start`/`join`; in-flight work for an older value is
    /// stale.
    generation: u64,
    /// Termination latch for the current generation.
    has_ended: bool,
    role: Option<Role>,
    screen_sharing: bool,
    remote_stream: Option<Arc<RemoteStream>>,
    error: Option<CallError>,
    call: CallResources,
}

impl SessionState {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && !self.has_ended
    }

    fn is_current_link(&self, generation: u64, link_id: LinkId) -> bool {
        self.is_current(generation) && self.call.link.as_ref().map(|link| link.id()) == Some(link_id)
    }

    fn take_call(&mut self) -> CallResources {
        self.role = None;
        self.screen_sharing = false;
        self.remote_stream = None;
        std::mem::take(&mut self.call)
    }
}

pub(super) struct SessionInner {
    pub(super) config: CallConfig,
    pub(super) media: MediaSource,
    pub(super) signaling: Arc<SignalingChannel>,
    connector: Arc<dyn PeerConnector>,
    state: Mutex<SessionState>,
    status: watch::Sender<CallStatus>,
    events: broadcast::Sender<CallEvent>,
    next_link: AtomicU64,
}

impl SessionInner {
    pub(super) fn new(
        config: CallConfig,
        capture: Arc<dyn CaptureBackend>,
        bus: Arc<dyn Bus>,
        rooms: Arc<dyn RoomDirectory>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let media = MediaSource::new(capture, config.constraints.clone(), config.device_retry);
        let (status, _) = watch::channel(CallStatus::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            media,
            signaling: Arc::new(SignalingChannel::new(bus, rooms)),
            connector,
            state: Mutex::new(SessionState {
                generation: 0,
                has_ended: true,
                role: None,
                screen_sharing: false,
                remote_stream: None,
                error: None,
                call: CallResources::default(),
            }),
            status,
            events,
            next_link: AtomicU64::new(1),
        }
    }

    pub(super) fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    pub(super) fn status_watch(&self) -> watch::Receiver<CallStatus> {
        self.status.subscribe()
    }

    pub(super) fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub(super) fn remote_stream(&self) -> Option<Arc<RemoteStream>> {
        self.state.lock().remote_stream.clone()
    }

    pub(super) fn error(&self) -> Option<CallError> {
        self.state.lock().error.clone()
    }

    pub(super) fn room_id(&self) -> Option<RoomId> {
        self.state.lock().call.room_id.clone()
    }

    pub(super) fn role(&self) -> Option<Role> {
        self.state.lock().role
    }

    pub(super) fn is_screen_sharing(&self) -> bool {
        self.state.lock().screen_sharing
    }

    pub(super) fn current_link(&self) -> Option<Arc<PeerLink>> {
        self.state.lock().call.link.clone()
    }

    pub(super) fn is_current(&self, generation: u64) -> bool {
        self.state.lock().is_current(generation)
    }

    fn ensure_current(&self, generation: u64) -> CallResult<()> {
        if self.is_current(generation) {
            Ok(())
        } else {
            Err(CallError::Aborted)
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    /// Callers hold the state lock so status changes stay ordered with the
    /// state they describe.
    fn set_status(&self, next: CallStatus) {
        let previous = self.status.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "call status changed");
            self.emit(CallEvent::StatusChanged {
                from: previous,
                to: next,
            });
        }
    }

    fn begin_call(&self, operation: &str) -> CallResult<(u64, CallResources)> {
        let mut state = self.state.lock();
        let status = self.status();
        if matches!(status, CallStatus::Connecting | CallStatus::Connected) {
            return Err(CallError::InvalidState(format!(
                "cannot {operation} while {status}"
            )));
        }
        state.generation += 1;
        state.has_ended = false;
        state.error = None;
        let leftovers = state.take_call();
        self.set_status(CallStatus::Connecting);
        debug!(generation = state.generation, operation, "call attempt started");
        Ok((state.generation, leftovers))
    }

    pub(super) async fn start(self: &Arc<Self>) -> CallResult<RoomId> {
        let (generation, leftovers) = self.begin_call("start")?;
        leftovers.dispose(true).await;
        let result = self.run_start(generation).await;
        self.settle(generation, result).await
    }

    async fn run_start(self: &Arc<Self>, generation: u64) -> CallResult<RoomId> {
        self.acquire_camera(generation).await?;
        let room_id = self.signaling.create_room().await?;
        self.claim_room(generation, &room_id, Role::Offerer)?;
        self.open_room(generation, &room_id).await?;
        let link = self.install_link(generation, Role::Offerer).await?;
        link.begin_as_offerer().await?;
        self.ensure_current(generation)?;
        info!(room_id = %room_id, "call started; waiting for an answer");
        Ok(room_id)
    }

    pub(super) async fn join(self: &Arc<Self>, room_id: &str) -> CallResult<RoomId> {
        let (generation, leftovers) = self.begin_call("join")?;
        leftovers.dispose(true).await;
        let result = self.run_join(generation, room_id).await;
        self.settle(generation, result).await
    }

    async fn run_join(self: &Arc<Self>, generation: u64, room_id: &str) -> CallResult<RoomId> {
        self.acquire_camera(generation).await?;
        let room_id = self.signaling.join_room(room_id).await?;
        self.claim_room(generation, &room_id, Role::Answerer)?;
        self.open_room(generation, &room_id).await?;
        if let Err(err) = self
            .signaling
            .send(&room_id, &SignalingMessage::Ready)
            .await
        {
            warn!(room_id = %room_id, error = %err, "failed to announce readiness");
        }
        self.ensure_current(generation)?;
        info!(room_id = %room_id, "joined call; waiting for an offer");
        Ok(room_id)
    }

    async fn acquire_camera(&self, generation: u64) -> CallResult<LocalStream> {
        let stream = self.media.camera().await?;
        let state = self.state.lock();
        if state.is_current(generation) {
            drop(state);
            self.emit(CallEvent::LocalStream(Some(stream.clone())));
            return Ok(stream);
        }
        // The call ended while the device was opening; nobody else will
        // release this stream.
        if state.has_ended {
            self.media.release();
        }
        Err(CallError::Aborted)
    }

    fn claim_room(&self, generation: u64, room_id: &RoomId, role: Role) -> CallResult<()> {
        let mut state = self.state.lock();
        if !state.is_current(generation) {
            return Err(CallError::Aborted);
        }
        state.call.room_id = Some(room_id.clone());
        state.role = Some(role);
        Ok(())
    }

    /// Subscribes to the room and starts the dispatcher for this generation.
    async fn open_room(self: &Arc<Self>, generation: u64, room_id: &RoomId) -> CallResult<()> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let subscription = self
            .signaling
            .subscribe(room_id, move |message| {
                let _ = signal_tx.send(message);
            })
            .await?;
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        if !state.is_current(generation) {
            drop(state);
            subscription.unsubscribe();
            return Err(CallError::Aborted);
        }
        state.call.subscription = Some(subscription);
        state.call.link_events = Some(link_tx);
        state.call.dispatcher = Some(tokio::spawn(dispatch::run(
            Arc::downgrade(self),
            generation,
            signal_rx,
            link_rx,
        )));
        Ok(())
    }

    /// Makes a fresh link the current one and closes its predecessor.
    /// Replacing a link restarts negotiation, so status returns to
    /// `Connecting`.
    async fn install_link(&self, generation: u64, role: Role) -> CallResult<Arc<PeerLink>> {
        let (link, previous) = {
            let mut state = self.state.lock();
            if !state.is_current(generation) {
                return Err(CallError::Aborted);
            }
            let (Some(room_id), Some(events)) =
                (state.call.room_id.clone(), state.call.link_events.clone())
            else {
                return Err(CallError::Aborted);
            };
            let id = self.next_link.fetch_add(1, Ordering::SeqCst);
            let link = PeerLink::new(
                role,
                PeerEventSink::new(id, events),
                self.connector.clone(),
                Arc::new(RoomSink::new(self.signaling.clone(), room_id)),
                self.media.watch(),
                LinkOptions::from(&self.config),
            );
            let previous = state.call.link.replace(link.clone());
            if previous.is_some() {
                state.error = None;
                state.remote_stream = None;
                self.set_status(CallStatus::Connecting);
            }
            (link, previous)
        };
        if let Some(previous) = previous {
            debug!(previous = previous.id(), next = link.id(), "superseding peer link");
            previous.close().await;
        }
        debug!(link_id = link.id(), ?role, "peer link installed");
        Ok(link)
    }

    /// Resolves a finished `start`/`join`. A real failure becomes the session
    /// error; an attempt overtaken by termination is reported as `Aborted`
    /// and leaves the session alone.
    async fn settle<T>(&self, generation: u64, result: CallResult<T>) -> CallResult<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(CallError::Aborted) => {
                debug!(generation, "call attempt overtaken by termination");
                return Err(CallError::Aborted);
            }
            Err(err) => err,
        };
        let resources = {
            let mut state = self.state.lock();
            if !state.is_current(generation) {
                return Err(CallError::Aborted);
            }
            state.error = Some(err.clone());
            let resources = state.take_call();
            self.set_status(CallStatus::Error);
            resources
        };
        warn!(error = %err, "call attempt failed");
        self.emit(CallEvent::Error(err.clone()));
        resources.dispose(true).await;
        Err(err)
    }

    /// The one termination path. The first caller per call wins; everyone
    /// after gets false.
    pub(super) async fn terminate(&self, reason: EndReason) -> bool {
        let (generation, resources, send_hangup) = {
            let mut state = self.state.lock();
            if state.has_ended {
                debug!(?reason, "call already ended");
                return false;
            }
            state.has_ended = true;
            state.error = None;
            let link_state = state.call.link.as_ref().map(|link| link.connection_state());
            let resources = state.take_call();
            let send_hangup = reason == EndReason::Local
                && resources.room_id.is_some()
                && link_state != Some(ConnectionState::Disconnected);
            (state.generation, resources, send_hangup)
        };
        let room_id = resources.room_id.clone();

        if send_hangup {
            if let Some(room_id) = &room_id {
                match self.signaling.send(room_id, &SignalingMessage::Hangup).await {
                    Ok(()) => debug!(room_id = %room_id, "hangup sent"),
                    Err(err) => {
                        warn!(room_id = %room_id, error = %err, "failed to send hangup; ending locally")
                    }
                }
            }
        }
        resources
            .dispose(reason != EndReason::RemoteHangup)
            .await;

        {
            let state = self.state.lock();
            if state.generation == generation {
                if self.media.release() {
                    self.emit(CallEvent::LocalStream(None));
                }
                self.set_status(CallStatus::Idle);
            }
        }
        self.emit(CallEvent::Ended { reason });
        info!(?reason, room_id = ?room_id.as_ref().map(RoomId::as_str), "call ended");
        true
    }

    pub(super) async fn handle_signal(&self, generation: u64, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer { sdp } => self.on_offer(generation, sdp).await,
            SignalingMessage::Answer { sdp } => {
                let Some(link) = self.current_link() else {
                    debug!("answer without a peer link; ignoring");
                    return;
                };
                match link.accept_answer(sdp).await {
                    Ok(true) => {}
                    Ok(false) => debug!(link_id = link.id(), "stale answer ignored"),
                    Err(err) => self.on_negotiation_error(generation, link.id(), err).await,
                }
            }
            SignalingMessage::IceCandidate { candidate } => {
                let link = match (self.current_link(), self.role()) {
                    (Some(link), _) => link,
                    // Candidates can beat the offer; an answerer queues them
                    // on the link the offer will use.
                    (None, Some(Role::Answerer)) => {
                        match self.install_link(generation, Role::Answerer).await {
                            Ok(link) => link,
                            Err(_) => return,
                        }
                    }
                    (None, _) => {
                        debug!("candidate without a peer link; ignoring");
                        return;
                    }
                };
                let disposition = link.add_remote_candidate(candidate).await;
                trace!(link_id = link.id(), ?disposition, "remote candidate handled");
            }
            SignalingMessage::Hangup => {
                info!("peer hung up");
                self.terminate(EndReason::RemoteHangup).await;
            }
            SignalingMessage::Ready => {
                let Some(link) = self.current_link() else {
                    return;
                };
                match link.redeliver_offer().await {
                    Ok(true) => {}
                    Ok(false) => debug!("peer ready; no offer awaiting an answer"),
                    Err(err) => warn!(error = %err, "failed to redeliver offer"),
                }
            }
        }
    }

    async fn on_offer(&self, generation: u64, sdp: String) {
        let (role, current) = {
            let state = self.state.lock();
            (state.role, state.call.link.clone())
        };
        if role != Some(Role::Answerer) {
            warn!("offer received by the offering side; ignoring");
            return;
        }
        let reusable = current.filter(|link| {
            !link.is_closed()
                && !link.connection_state().is_terminal()
                && link.applied_offer().is_none_or(|applied| applied == sdp)
        });
        let link = match reusable {
            Some(link) => link,
            None => match self.install_link(generation, Role::Answerer).await {
                Ok(link) => link,
                Err(_) => return,
            },
        };
        if let Err(err) = link.accept_offer(sdp).await {
            self.on_negotiation_error(generation, link.id(), err).await;
        }
    }

    /// A negotiation step failed outright: surface it and discard the link.
    /// The room stays open so a new offer can recover the call.
    async fn on_negotiation_error(&self, generation: u64, link_id: LinkId, err: NegotiationError) {
        let error = CallError::from(err);
        if error == CallError::Aborted {
            debug!(link_id, "negotiation step overtaken by link close");
            return;
        }
        let link = {
            let mut state = self.state.lock();
            if !state.is_current_link(generation, link_id) {
                return;
            }
            state.error = Some(error.clone());
            self.set_status(CallStatus::Error);
            state.call.link.clone()
        };
        warn!(link_id, error = %error, "negotiation failed");
        self.emit(CallEvent::Error(error));
        if let Some(link) = link {
            link.close().await;
        }
    }

    pub(super) async fn handle_link_event(&self, generation: u64, event: LinkEvent) {
        let LinkEvent { link: link_id, event } = event;
        let Some(link) = self.current_link().filter(|link| link.id() == link_id) else {
            trace!(link_id, "event from superseded link dropped");
            return;
        };
        let Some(update) = link.apply_event(event).await else {
            return;
        };

        let mut state = self.state.lock();
        if !state.is_current_link(generation, link_id) {
            return;
        }
        match update {
            LinkUpdate::State(ConnectionState::New) => {}
            LinkUpdate::State(ConnectionState::Connecting) => self.set_status(CallStatus::Connecting),
            LinkUpdate::State(ConnectionState::Connected) => {
                state.error = None;
                self.set_status(CallStatus::Connected);
            }
            LinkUpdate::State(ConnectionState::Disconnected) => {
                self.set_status(CallStatus::Disconnected)
            }
            LinkUpdate::State(ConnectionState::Failed) => {
                let error = CallError::Negotiation(NegotiationError::ConnectionFailed(
                    "ice transport failed".into(),
                ));
                state.error = Some(error.clone());
                self.set_status(CallStatus::Error);
                self.emit(CallEvent::Error(error));
            }
            LinkUpdate::RemoteStream(stream) => {
                state.remote_stream = Some(stream.clone());
                self.emit(CallEvent::RemoteStream(Some(stream)));
            }
        }
    }

    pub(super) async fn toggle_screen_share(self: &Arc<Self>) -> CallResult<bool> {
        let (active, sharing) = {
            let state = self.state.lock();
            (!state.has_ended, state.screen_sharing)
        };
        if !active {
            return Err(CallError::InvalidState("no active call".into()));
        }
        let target = if sharing {
            CaptureKind::Camera
        } else {
            CaptureKind::Screen
        };
        self.switch_source(target).await?;
        Ok(target == CaptureKind::Screen)
    }

    /// Moves local media to `kind` and the outbound senders with it. Never
    /// changes status.
    async fn switch_source(self: &Arc<Self>, kind: CaptureKind) -> CallResult<LocalStream> {
        let generation = {
            let mut state = self.state.lock();
            if state.has_ended {
                return Err(CallError::Aborted);
            }
            if let Some(watch) = state.call.screen_watch.take() {
                watch.abort();
            }
            state.generation
        };
        let stream = match self.media.switch_to(kind).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(source = ?kind, error = %err, "failed to switch local source");
                self.rewatch_active_screen();
                return Err(err.into());
            }
        };

        let link = {
            let mut state = self.state.lock();
            if !state.is_current(generation) {
                // The call ended while the device was opening; the stream
                // just made active has no owner left.
                if state.has_ended {
                    self.media.release();
                }
                debug!(source = ?kind, "source switch overtaken by termination");
                return Err(CallError::Aborted);
            }
            state.screen_sharing = kind == CaptureKind::Screen;
            if kind == CaptureKind::Screen {
                state.call.screen_watch = self.watch_screen(&stream);
            }
            state.call.link.clone()
        };
        self.emit(CallEvent::LocalStream(Some(stream.clone())));
        info!(source = ?kind, stream_id = stream.id(), "local source switched");

        if let Some(link) = link {
            if let Err(err) = link.replace_tracks(&stream).await {
                let error = CallError::from(err);
                if error != CallError::Aborted {
                    warn!(link_id = link.id(), error = %error, "failed to move outbound tracks");
                    return Err(error);
                }
            }
        }
        Ok(stream)
    }

    fn rewatch_active_screen(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if !state.screen_sharing || state.has_ended {
            return;
        }
        if let Some(stream) = self.media.active().filter(|s| s.source() == CaptureKind::Screen) {
            state.call.screen_watch = self.watch_screen(&stream);
        }
    }

    /// Reverts to the camera when the screen track ends on its own, e.g. the
    /// user stopped sharing from the system UI.
    fn watch_screen(self: &Arc<Self>, stream: &LocalStream) -> Option<JoinHandle<()>> {
        let track = stream.track(TrackKind::Video)?.clone();
        let stream_id = stream.id().to_owned();
        let session = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            track.ended().await;
            if let Some(session) = session.upgrade() {
                session.revert_screen_share(&stream_id).await;
            }
        }))
    }

    async fn revert_screen_share(self: &Arc<Self>, stream_id: &str) {
        {
            let mut state = self.state.lock();
            let still_sharing = self
                .media
                .active()
                .is_some_and(|stream| stream.id() == stream_id);
            if state.has_ended || !state.screen_sharing || !still_sharing {
                return;
            }
            // This task is the watcher; let it finish.
            state.call.screen_watch = None;
        }
        info!(stream_id, "screen capture ended; switching back to camera");
        match self.switch_source(CaptureKind::Camera).await {
            Ok(_) => {}
            Err(CallError::Aborted) => debug!(stream_id, "call ended before the camera returned"),
            Err(err) => warn!(error = %err, "failed to restore camera after screen share"),
        }
    }

    pub(super) async fn renegotiate(&self) -> CallResult<()> {
        let generation = {
            let state = self.state.lock();
            if state.has_ended || state.call.room_id.is_none() {
                return Err(CallError::InvalidState("no active call".into()));
            }
            if state.role != Some(Role::Offerer) {
                return Err(CallError::InvalidState(
                    "only the offering side can renegotiate".into(),
                ));
            }
            state.generation
        };
        let link = self.install_link(generation, Role::Offerer).await?;
        info!(link_id = link.id(), "renegotiating");
        if let Err(err) = link.begin_as_offerer().await {
            self.on_negotiation_error(generation, link.id(), err.clone())
                .await;
            return Err(err.into());
        }
        Ok(())
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.has_ended {
            return;
        }
        state.has_ended = true;
        let resources = state.take_call();
        if let Some(subscription) = &resources.subscription {
            subscription.unsubscribe();
        }
        for task in [resources.dispatcher, resources.screen_watch].into_iter().flatten() {
            task.abort();
        }
        self.media.release();
        if let Some(link) = resources.link {
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { link.close().await });
                }
                Err(_) => debug!(link_id = link.id(), "no runtime to close peer link on drop"),
            }
        }
        debug!("call session dropped without leaving; no hangup sent");
    }
}
