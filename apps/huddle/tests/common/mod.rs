#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_core::media::SyntheticCapture;
use huddle_core::peer::mock::{MockConnector, MockPeerConnection};
use huddle_core::signaling::{IceCandidate, SignalingChannel, SignalingMessage, Subscription};
use huddle_core::{CallConfig, CallEvent, CallSession, CallStatus, RoomId};
use signal_bus::{LocalBus, LocalRoomDirectory};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(5);

/// One relay shared by every party in a test.
pub struct Rig {
    pub bus: Arc<LocalBus>,
    pub rooms: Arc<LocalRoomDirectory>,
}

pub struct Party {
    pub session: CallSession,
    pub capture: Arc<SyntheticCapture>,
    pub connector: Arc<MockConnector>,
}

impl Party {
    pub fn connection(&self) -> Arc<MockPeerConnection> {
        self.connector.last().expect("peer connection created")
    }
}

impl Rig {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(LocalBus::new()),
            rooms: Arc::new(LocalRoomDirectory::new()),
        }
    }

    pub fn party(&self) -> Party {
        self.party_with(SyntheticCapture::new())
    }

    pub fn party_with(&self, capture: SyntheticCapture) -> Party {
        let capture = Arc::new(capture);
        let connector = Arc::new(MockConnector::new());
        let config = CallConfig::builder()
            .localhost_only()
            .build()
            .expect("valid config");
        let session = CallSession::new(
            config,
            capture.clone(),
            self.bus.clone(),
            self.rooms.clone(),
            connector.clone(),
        );
        Party {
            session,
            capture,
            connector,
        }
    }

    /// A bare signaling endpoint standing in for a remote peer.
    pub fn channel(&self) -> SignalingChannel {
        SignalingChannel::new(self.bus.clone(), self.rooms.clone())
    }
}

/// A remote endpoint listening on a room, with its traffic queued for
/// inspection.
pub struct Inbox {
    pub channel: SignalingChannel,
    pub subscription: Subscription,
    room: RoomId,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl Inbox {
    pub async fn open(channel: SignalingChannel, room: &RoomId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = channel
            .subscribe(room, move |message| {
                let _ = tx.send(message);
            })
            .await
            .expect("subscribe");
        Self {
            channel,
            subscription,
            room: room.clone(),
            rx,
        }
    }

    pub async fn send(&self, message: SignalingMessage) {
        self.channel
            .send(&self.room, &message)
            .await
            .expect("send signal");
    }

    /// Next message accepted by `pred`; everything before it is skipped.
    pub async fn next_matching(
        &mut self,
        mut pred: impl FnMut(&SignalingMessage) -> bool,
    ) -> SignalingMessage {
        tokio::time::timeout(WAIT, async {
            loop {
                let message = self.rx.recv().await.expect("inbox closed");
                if pred(&message) {
                    return message;
                }
            }
        })
        .await
        .expect("timed out waiting for signal")
    }

    pub async fn next_offer(&mut self) -> String {
        match self
            .next_matching(|m| matches!(m, SignalingMessage::Offer { .. }))
            .await
        {
            SignalingMessage::Offer { sdp } => sdp,
            _ => unreachable!(),
        }
    }

    /// Everything delivered within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<SignalingMessage> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + window;
        while let Ok(Some(message)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            seen.push(message);
        }
        seen
    }
}

pub fn host_candidate(n: u8) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 192.0.2.{n} 5000 typ host"))
}

pub async fn wait_for_status(session: &CallSession, status: CallStatus) {
    let mut watch = session.status_watch();
    tokio::time::timeout(WAIT, watch.wait_for(|current| *current == status))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {status}, at {}", session.status()))
        .expect("status channel closed");
}

pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn drain_events(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn status_changes(events: &[CallEvent]) -> Vec<(CallStatus, CallStatus)> {
    events
        .iter()
        .filter_map(|event| match event {
            CallEvent::StatusChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}
