use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{Bus, BusError, BusMessage, BusResult, BusSubscription, RoomDirectory};

#[derive(Default)]
struct Topic {
    last_seq: u64,
    subscribers: Vec<mpsc::UnboundedSender<BusMessage>>,
    retained: VecDeque<BusMessage>,
}

impl Topic {
    /// Drops closed subscribers; true while the topic still has a reader or
    /// history worth keeping.
    fn prune(&mut self) -> bool {
        self.subscribers.retain(|tx| !tx.is_closed());
        !self.subscribers.is_empty() || !self.retained.is_empty()
    }
}

/// In-process relay. Optionally retains the last few messages per topic and
/// replays them to new subscribers, the way a table-backed realtime service
/// would hand out recent rows.
pub struct LocalBus {
    topics: RwLock<HashMap<String, Topic>>,
    replay_depth: usize,
    available: AtomicBool,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            replay_depth: 0,
            available: AtomicBool::new(true),
        }
    }

    pub fn with_replay(depth: usize) -> Self {
        Self {
            replay_depth: depth,
            ..Self::new()
        }
    }

    /// Simulates the relay going away. Publish and subscribe fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|t| t.subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Topics currently tracked, including ones kept only for replay.
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    fn ensure_available(&self) -> BusResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable("local bus offline".into()))
        }
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<Option<u64>> {
        self.ensure_available()?;
        let mut topics = self.topics.write();
        let entry = topics.entry(topic.to_string()).or_default();
        entry.last_seq += 1;
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
            seq: Some(entry.last_seq),
        };
        if self.replay_depth > 0 {
            if entry.retained.len() == self.replay_depth {
                entry.retained.pop_front();
            }
            entry.retained.push_back(message.clone());
        }
        entry
            .subscribers
            .retain(|tx| tx.send(message.clone()).is_ok());
        let seq = entry.last_seq;
        if !entry.prune() {
            topics.remove(topic);
            trace!(topic, "local bus topic dropped");
        }
        trace!(topic, seq, "local bus publish");
        Ok(Some(seq))
    }

    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription> {
        self.ensure_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.write();
        topics.retain(|_, entry| entry.prune());
        let entry = topics.entry(topic.to_string()).or_default();
        for message in &entry.retained {
            let _ = tx.send(message.clone());
        }
        entry.subscribers.push(tx);
        debug!(topic, watermark = entry.last_seq, "local bus subscribe");
        Ok(BusSubscription::new(rx, Some(entry.last_seq)))
    }
}

/// In-memory room directory with optional expiry.
pub struct LocalRoomDirectory {
    rooms: RwLock<HashMap<String, Instant>>,
    ttl: Option<Duration>,
    available: AtomicBool,
}

impl Default for LocalRoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRoomDirectory {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            ttl: None,
            available: AtomicBool::new(true),
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::new()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Registers a room under a caller-chosen id.
    pub fn insert(&self, room_id: impl Into<String>) {
        self.rooms.write().insert(room_id.into(), Instant::now());
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    fn ensure_available(&self) -> BusResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable("room directory offline".into()))
        }
    }
}

#[async_trait]
impl RoomDirectory for LocalRoomDirectory {
    async fn create_room(&self) -> BusResult<String> {
        self.ensure_available()?;
        let room_id = uuid::Uuid::new_v4().to_string();
        self.insert(room_id.clone());
        debug!(room_id = %room_id, "room created");
        Ok(room_id)
    }

    async fn room_exists(&self, room_id: &str) -> BusResult<bool> {
        self.ensure_available()?;
        let mut rooms = self.rooms.write();
        let Some(created) = rooms.get(room_id).copied() else {
            return Ok(false);
        };
        if let Some(ttl) = self.ttl {
            if created.elapsed() >= ttl {
                rooms.remove(room_id);
                debug!(room_id, "room expired");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_timeout::tokio_timeout_test;

    #[tokio_timeout_test(5)]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("demo").await.unwrap();
        assert_eq!(sub.watermark(), Some(0));
        let seq = bus.publish("demo", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(seq, Some(1));
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic, "demo");
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
        assert_eq!(msg.seq, Some(1));
    }

    #[tokio_timeout_test(5)]
    async fn abandoned_topics_are_forgotten() {
        let bus = LocalBus::new();
        for room in 0..8 {
            let sub = bus.subscribe(&format!("room-{room}")).await.unwrap();
            bus.publish(&format!("room-{room}"), Bytes::from_static(b"x"))
                .await
                .unwrap();
            drop(sub);
        }
        let _live = bus.subscribe("lobby").await.unwrap();
        assert_eq!(bus.topic_count(), 1);

        // Nobody listening and nothing retained: nothing to keep.
        bus.publish("void", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(bus.topic_count(), 1);
    }

    #[tokio_timeout_test(5)]
    async fn replay_history_outlives_its_subscribers() {
        let bus = LocalBus::with_replay(2);
        bus.publish("room", Bytes::from_static(b"kept")).await.unwrap();
        drop(bus.subscribe("other").await.unwrap());
        let _lobby = bus.subscribe("lobby").await.unwrap();
        assert_eq!(bus.topic_count(), 2);
        let mut late = bus.subscribe("room").await.unwrap();
        assert_eq!(late.recv().await.unwrap().payload, Bytes::from_static(b"kept"));
    }

    #[tokio_timeout_test(5)]
    async fn publish_order_is_preserved_per_topic() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("room").await.unwrap();
        for i in 0..20u8 {
            bus.publish("room", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..20u8 {
            assert_eq!(sub.recv().await.unwrap().payload[0], i);
        }
    }

    #[tokio_timeout_test(5)]
    async fn replay_bus_hands_out_history_below_watermark() {
        let bus = LocalBus::with_replay(4);
        bus.publish("room", Bytes::from_static(b"old")).await.unwrap();
        let mut sub = bus.subscribe("room").await.unwrap();
        assert_eq!(sub.watermark(), Some(1));
        bus.publish("room", Bytes::from_static(b"new")).await.unwrap();

        let replayed = sub.recv().await.unwrap();
        assert_eq!(replayed.seq, Some(1));
        let fresh = sub.recv().await.unwrap();
        assert_eq!(fresh.seq, Some(2));
    }

    #[tokio_timeout_test(5)]
    async fn dropped_subscription_is_pruned_on_publish() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("room").await.unwrap();
        assert_eq!(bus.subscriber_count("room"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("room"), 0);
        bus.publish("room", Bytes::new()).await.unwrap();
        assert!(bus.topics.read().get("room").unwrap().subscribers.is_empty());
    }

    #[tokio_timeout_test(5)]
    async fn unavailable_bus_rejects_calls() {
        let bus = LocalBus::new();
        bus.set_available(false);
        assert!(matches!(
            bus.publish("room", Bytes::new()).await,
            Err(BusError::Unavailable(_))
        ));
        assert!(bus.subscribe("room").await.is_err());
    }

    #[tokio_timeout_test(5)]
    async fn directory_creates_unique_rooms() {
        let rooms = LocalRoomDirectory::new();
        let a = rooms.create_room().await.unwrap();
        let b = rooms.create_room().await.unwrap();
        assert_ne!(a, b);
        assert!(rooms.room_exists(&a).await.unwrap());
        assert!(!rooms.room_exists("missing-room").await.unwrap());
    }

    #[tokio_timeout_test(5, paused)]
    async fn directory_expires_rooms_after_ttl() {
        let rooms = LocalRoomDirectory::with_ttl(Duration::from_secs(60));
        let id = rooms.create_room().await.unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(rooms.room_exists(&id).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!rooms.room_exists(&id).await.unwrap());
        assert_eq!(rooms.room_count(), 0);
    }
}
