//! Room-scoped signaling over a publish/subscribe relay.

mod message;

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use signal_bus::{Bus, RoomDirectory, signaling_topic};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::SignalingError;

pub use message::{IceCandidate, SdpField, SignalEnvelope, SignalPayload, SignalType, SignalingMessage};

const RECENT_ID_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Bounded memory of delivered message ids.
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if the id was already recorded.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_owned());
        self.seen.insert(id.to_owned());
        true
    }
}

struct Listener {
    id: u64,
    room_id: RoomId,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Listener {
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Handle to a live room listener. `unsubscribe` may be called any number of
/// times; dropping the handle does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    room_id: RoomId,
    closed: Arc<AtomicBool>,
    abort: tokio::task::AbortHandle,
}

impl Subscription {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort.abort();
        debug!(room_id = %self.room_id, listener = self.id, "signaling listener removed");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Binds a room to an ordered, de-duplicated stream of signaling messages.
///
/// Each channel has its own peer id; messages it published are never handed
/// back to it. At most one listener is active per channel.
pub struct SignalingChannel {
    bus: Arc<dyn Bus>,
    rooms: Arc<dyn RoomDirectory>,
    peer_id: String,
    listener: Mutex<Option<Listener>>,
    next_listener: AtomicU64,
}

impl SignalingChannel {
    pub fn new(bus: Arc<dyn Bus>, rooms: Arc<dyn RoomDirectory>) -> Self {
        Self {
            bus,
            rooms,
            peer_id: uuid::Uuid::new_v4().to_string(),
            listener: Mutex::new(None),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn create_room(&self) -> Result<RoomId, SignalingError> {
        let room_id = RoomId::new(self.rooms.create_room().await?);
        info!(room_id = %room_id, "room created");
        Ok(room_id)
    }

    pub async fn join_room(&self, room_id: &str) -> Result<RoomId, SignalingError> {
        let trimmed = room_id.trim();
        if trimmed.is_empty() {
            return Err(SignalingError::RoomNotFound(room_id.to_owned()));
        }
        if !self.rooms.room_exists(trimmed).await? {
            warn!(room_id = trimmed, "room not found");
            return Err(SignalingError::RoomNotFound(trimmed.to_owned()));
        }
        info!(room_id = trimmed, "room joined");
        Ok(RoomId::new(trimmed))
    }

    pub async fn send(
        &self,
        room_id: &RoomId,
        message: &SignalingMessage,
    ) -> Result<(), SignalingError> {
        let envelope = SignalEnvelope::new(room_id.as_str(), &self.peer_id, message);
        let payload = envelope.encode()?;
        let seq = self
            .bus
            .publish(&signaling_topic(room_id.as_str()), payload)
            .await?;
        debug!(
            room_id = %room_id,
            signal = ?envelope.signal_type,
            seq = ?seq,
            "signal sent"
        );
        Ok(())
    }

    /// Starts delivering messages for `room_id` to `on_message`, in publish
    /// order. Any previous listener on this channel is torn down first.
    pub async fn subscribe<F>(
        &self,
        room_id: &RoomId,
        on_message: F,
    ) -> Result<Subscription, SignalingError>
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        self.teardown_listener();

        let mut inbound = self.bus.subscribe(&signaling_topic(room_id.as_str())).await?;
        let watermark = inbound.watermark();
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::new(AtomicBool::new(false));

        let task = {
            let closed = closed.clone();
            let room = room_id.clone();
            let peer_id = self.peer_id.clone();
            tokio::spawn(async move {
                let mut recent = RecentIds::new(RECENT_ID_CAPACITY);
                while let Some(raw) = inbound.recv().await {
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if let (Some(watermark), Some(seq)) = (watermark, raw.seq) {
                        if seq <= watermark {
                            trace!(room_id = %room, seq, "skipping message published before subscribe");
                            continue;
                        }
                    }
                    let envelope = match SignalEnvelope::decode(&raw.payload) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            warn!(room_id = %room, error = %err, "dropping undecodable signal");
                            continue;
                        }
                    };
                    if envelope.sender_id == peer_id || envelope.room_id != room.as_str() {
                        continue;
                    }
                    if let Some(message_id) = envelope.id.as_deref() {
                        if !recent.insert(message_id) {
                            debug!(room_id = %room, message_id, "dropping duplicate signal");
                            continue;
                        }
                    }
                    match envelope.message() {
                        Ok(message) => {
                            trace!(room_id = %room, signal = ?envelope.signal_type, "signal received");
                            on_message(message);
                        }
                        Err(err) => warn!(room_id = %room, error = %err, "dropping malformed signal"),
                    }
                }
            })
        };

        let subscription = Subscription {
            id,
            room_id: room_id.clone(),
            closed: closed.clone(),
            abort: task.abort_handle(),
        };
        let previous = self.listener.lock().replace(Listener {
            id,
            room_id: room_id.clone(),
            closed,
            task,
        });
        if let Some(previous) = previous {
            previous.shut();
        }
        info!(room_id = %room_id, listener = id, "signaling listener active");
        Ok(subscription)
    }

    pub fn has_active_subscription(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|listener| !listener.closed.load(Ordering::SeqCst))
    }

    pub fn active_room(&self) -> Option<RoomId> {
        self.listener
            .lock()
            .as_ref()
            .filter(|listener| !listener.closed.load(Ordering::SeqCst))
            .map(|listener| listener.room_id.clone())
    }

    fn teardown_listener(&self) {
        if let Some(previous) = self.listener.lock().take() {
            debug!(room_id = %previous.room_id, listener = previous.id, "replacing signaling listener");
            previous.shut();
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.teardown_listener();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use signal_bus::{LocalBus, LocalRoomDirectory};
    use std::time::Duration;
    use test_timeout::tokio_timeout_test;
    use tokio::sync::mpsc;

    struct Fixture {
        bus: Arc<LocalBus>,
        rooms: Arc<LocalRoomDirectory>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                bus: Arc::new(LocalBus::new()),
                rooms: Arc::new(LocalRoomDirectory::new()),
            }
        }

        fn channel(&self) -> SignalingChannel {
            SignalingChannel::new(self.bus.clone(), self.rooms.clone())
        }
    }

    async fn listen(
        channel: &SignalingChannel,
        room: &RoomId,
    ) -> (Subscription, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = channel
            .subscribe(room, move |message| {
                let _ = tx.send(message);
            })
            .await
            .unwrap();
        (sub, rx)
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<SignalingMessage>) {
        let next = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(next.is_err(), "unexpected message: {next:?}");
    }

    #[tokio_timeout_test(5)]
    async fn delivers_in_publish_order_and_skips_own_messages() {
        let fixture = Fixture::new();
        let alice = fixture.channel();
        let bob = fixture.channel();
        let room = alice.create_room().await.unwrap();
        let (_sub, mut alice_rx) = listen(&alice, &room).await;
        let (_bob_sub, mut bob_rx) = listen(&bob, &room).await;

        for i in 0..5 {
            let candidate = IceCandidate::new(format!("candidate:{i}"));
            bob.send(&room, &SignalingMessage::IceCandidate { candidate })
                .await
                .unwrap();
        }
        for i in 0..5 {
            let Some(SignalingMessage::IceCandidate { candidate }) = alice_rx.recv().await else {
                panic!("expected candidate");
            };
            assert_eq!(candidate.candidate, format!("candidate:{i}"));
        }
        assert_silent(&mut bob_rx).await;
    }

    #[tokio_timeout_test(5)]
    async fn join_missing_room_is_room_not_found() {
        let fixture = Fixture::new();
        let channel = fixture.channel();
        let err = channel.join_room("missing-room").await.unwrap_err();
        assert_eq!(err, SignalingError::RoomNotFound("missing-room".into()));
        assert!(!channel.has_active_subscription());
    }

    #[tokio_timeout_test(5)]
    async fn relay_outage_is_relay_error() {
        let fixture = Fixture::new();
        let channel = fixture.channel();
        fixture.rooms.set_available(false);
        assert!(matches!(channel.create_room().await, Err(SignalingError::Relay(_))));

        fixture.bus.set_available(false);
        let result = channel.send(&RoomId::from("r1"), &SignalingMessage::Hangup).await;
        assert!(matches!(result, Err(SignalingError::Relay(_))));
        let result = channel.subscribe(&RoomId::from("r1"), |_| {}).await;
        assert!(matches!(result, Err(SignalingError::Relay(_))));
        assert!(!channel.has_active_subscription());
    }

    #[tokio_timeout_test(5)]
    async fn resubscribing_replaces_previous_listener() {
        let fixture = Fixture::new();
        let channel = fixture.channel();
        let peer = fixture.channel();
        let first = RoomId::from("room-a");
        let second = RoomId::from("room-b");

        let (first_sub, mut first_rx) = listen(&channel, &first).await;
        let (_second_sub, mut second_rx) = listen(&channel, &second).await;
        assert!(!first_sub.is_active());
        assert_eq!(channel.active_room(), Some(second.clone()));

        peer.send(&first, &SignalingMessage::Hangup).await.unwrap();
        peer.send(&second, &SignalingMessage::Hangup).await.unwrap();
        assert_eq!(second_rx.recv().await, Some(SignalingMessage::Hangup));
        // The replaced listener's task is gone, so its sender is dropped.
        assert_eq!(first_rx.recv().await, None);
    }

    #[tokio_timeout_test(5)]
    async fn unsubscribe_is_idempotent() {
        let fixture = Fixture::new();
        let channel = fixture.channel();
        let peer = fixture.channel();
        let room = RoomId::from("r1");
        let (sub, mut rx) = listen(&channel, &room).await;

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!channel.has_active_subscription());
        peer.send(&room, &SignalingMessage::Hangup).await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio_timeout_test(5)]
    async fn history_before_subscribe_is_not_replayed() {
        let bus = Arc::new(LocalBus::with_replay(8));
        let rooms = Arc::new(LocalRoomDirectory::new());
        let channel = SignalingChannel::new(bus.clone(), rooms.clone());
        let peer = SignalingChannel::new(bus.clone(), rooms);
        let room = RoomId::from("r1");

        peer.send(&room, &SignalingMessage::Offer { sdp: "stale".into() })
            .await
            .unwrap();
        let (_sub, mut rx) = listen(&channel, &room).await;
        peer.send(&room, &SignalingMessage::Offer { sdp: "fresh".into() })
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(SignalingMessage::Offer { sdp: "fresh".into() })
        );
        assert_silent(&mut rx).await;
    }

    #[tokio_timeout_test(5)]
    async fn duplicate_delivery_is_suppressed() {
        let fixture = Fixture::new();
        let channel = fixture.channel();
        let room = RoomId::from("r1");
        let (_sub, mut rx) = listen(&channel, &room).await;

        let envelope = SignalEnvelope::new("r1", "remote-peer", &SignalingMessage::Hangup);
        let bytes = envelope.encode().unwrap();
        let topic = signaling_topic("r1");
        fixture.bus.publish(&topic, bytes.clone()).await.unwrap();
        fixture.bus.publish(&topic, bytes).await.unwrap();
        // Garbage and foreign-room traffic on the topic are dropped too.
        fixture
            .bus
            .publish(&topic, Bytes::from_static(b"not json"))
            .await
            .unwrap();
        let foreign = SignalEnvelope::new("r2", "remote-peer", &SignalingMessage::Ready);
        fixture
            .bus
            .publish(&topic, foreign.encode().unwrap())
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(SignalingMessage::Hangup));
        assert_silent(&mut rx).await;
    }

    #[test]
    fn recent_ids_forget_oldest_entries() {
        let mut recent = RecentIds::new(2);
        assert!(recent.insert("a"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(recent.insert("c"));
        assert!(recent.insert("a"));
    }
}
