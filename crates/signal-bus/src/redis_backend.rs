use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Bus, BusError, BusMessage, BusResult, BusSubscription, RoomDirectory};

const KEY_PREFIX: &str = "huddle";

fn to_bus_err(err: redis::RedisError) -> BusError {
    if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
        BusError::Unavailable(err.to_string())
    } else {
        BusError::Transport(err.to_string())
    }
}

fn channel_name(topic: &str) -> String {
    format!("{KEY_PREFIX}:{topic}")
}

/// Redis pub/sub relay. Pub/sub never replays, so messages carry no sequence.
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = Client::open(url).map_err(to_bus_err)?;
        let publisher = client.get_connection_manager().await.map_err(to_bus_err)?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<Option<u64>> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn
            .publish(channel_name(topic), payload.as_ref())
            .await
            .map_err(to_bus_err)?;
        Ok(None)
    }

    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(to_bus_err)?;
        let channel = channel_name(topic);
        pubsub.subscribe(&channel).await.map_err(to_bus_err)?;
        debug!(channel = %channel, "redis subscribe");

        let (tx, rx) = mpsc::unbounded_channel();
        let topic = topic.to_string();
        let pump = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable redis payload");
                        continue;
                    }
                };
                let message = BusMessage {
                    topic: topic.clone(),
                    payload: Bytes::from(payload),
                    seq: None,
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
        });
        Ok(BusSubscription::new(rx, None).with_pump(pump))
    }
}

/// Room directory keyed as `huddle:room:<id>` with an expiry.
pub struct RedisRoomDirectory {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisRoomDirectory {
    pub async fn connect(url: &str, ttl: Duration) -> BusResult<Self> {
        let client = Client::open(url).map_err(to_bus_err)?;
        let conn = client.get_connection_manager().await.map_err(to_bus_err)?;
        Ok(Self { conn, ttl })
    }

    fn room_key(room_id: &str) -> String {
        format!("{KEY_PREFIX}:room:{room_id}")
    }
}

#[async_trait]
impl RoomDirectory for RedisRoomDirectory {
    async fn create_room(&self) -> BusResult<String> {
        let room_id = uuid::Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::room_key(&room_id))
            .arg("waiting")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(to_bus_err)?;
        Ok(room_id)
    }

    async fn room_exists(&self, room_id: &str) -> BusResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::room_key(room_id))
            .query_async(&mut conn)
            .await
            .map_err(to_bus_err)?;
        Ok(exists)
    }
}
