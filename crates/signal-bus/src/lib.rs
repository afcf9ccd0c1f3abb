//! Publish/subscribe relay and room directory used to carry call signaling.
//!
//! The relay only promises per-topic publish order and at-least-once delivery of
//! messages published after a subscription is established. Transports that can
//! replay history stamp messages with a per-topic sequence number and report the
//! watermark at subscribe time so consumers can skip anything older.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod local;
#[cfg(feature = "redis")]
mod redis_backend;

pub use local::{LocalBus, LocalRoomDirectory};
#[cfg(feature = "redis")]
pub use redis_backend::{RedisBus, RedisRoomDirectory};

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Per-topic sequence number, when the transport assigns one.
    pub seq: Option<u64>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus closed")]
    Closed,
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publishes `payload` on `topic`, returning the sequence number assigned to
    /// it if the transport sequences messages.
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<Option<u64>>;

    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription>;
}

/// Live listener on one topic. Dropping it stops delivery.
pub struct BusSubscription {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    watermark: Option<u64>,
    pump: Option<JoinHandle<()>>,
}

impl BusSubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<BusMessage>, watermark: Option<u64>) -> Self {
        Self {
            receiver,
            watermark,
            pump: None,
        }
    }

    /// Ties a forwarding task to the subscription lifetime.
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    /// Highest sequence number already published on the topic when the
    /// subscription was established.
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Persistent store of call rooms. Only create and read are required.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn create_room(&self) -> BusResult<String>;

    async fn room_exists(&self, room_id: &str) -> BusResult<bool>;
}

pub fn signaling_topic(room_id: &str) -> String {
    format!("signaling:{room_id}")
}
