use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::coordinator::SessionInner;
use crate::error::SignalingError;
use crate::peer::{LinkEvent, SignalSink};
use crate::signaling::{RoomId, SignalingChannel, SignalingMessage};

/// Publishes a link's outbound messages into the call's room.
pub(super) struct RoomSink {
    signaling: Arc<SignalingChannel>,
    room_id: RoomId,
}

impl RoomSink {
    pub(super) fn new(signaling: Arc<SignalingChannel>, room_id: RoomId) -> Self {
        Self { signaling, room_id }
    }
}

#[async_trait]
impl SignalSink for RoomSink {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.signaling.send(&self.room_id, &message).await
    }
}

enum Input {
    Signal(SignalingMessage),
    Link(LinkEvent),
}

/// The call's single timeline. Inbound signaling and peer-connection
/// callbacks are applied here one at a time; the loop ends with the call
/// generation it was started for.
pub(super) async fn run(
    session: Weak<SessionInner>,
    generation: u64,
    mut signals: mpsc::UnboundedReceiver<SignalingMessage>,
    mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    loop {
        let input = tokio::select! {
            Some(message) = signals.recv() => Input::Signal(message),
            Some(event) = link_events.recv() => Input::Link(event),
            else => break,
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        if !session.is_current(generation) {
            break;
        }
        match input {
            Input::Signal(message) => session.handle_signal(generation, message).await,
            Input::Link(event) => session.handle_link_event(generation, event).await,
        }
    }
    debug!(generation, "call dispatcher stopped");
}
