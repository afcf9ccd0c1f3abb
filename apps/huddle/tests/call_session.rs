mod common;

use std::time::Duration;

use common::{Inbox, Rig, drain_events, eventually, host_candidate, status_changes, wait_for_status};
use futures::future::join_all;
use huddle_core::error::{DeviceError, NegotiationError};
use huddle_core::media::{CaptureKind, SyntheticCapture, TrackKind};
use huddle_core::peer::{IceState, PeerConnection, PeerEvent, SignalingState, TransportState};
use huddle_core::signaling::SignalingMessage;
use huddle_core::{CallError, CallEvent, CallStatus, EndReason, RoomId};
use signal_bus::signaling_topic;

/// Answers the party's offer from a bare signaling endpoint and reports the
/// connection as up.
async fn connect_with_remote(rig: &Rig, party: &common::Party, room: &RoomId) -> Inbox {
    let mut inbox = Inbox::open(rig.channel(), room).await;
    // The offer went out before this endpoint listened.
    inbox.send(SignalingMessage::Ready).await;
    let offer = inbox.next_offer().await;
    assert!(offer.starts_with("v=0 mock-"));

    inbox
        .send(SignalingMessage::Answer {
            sdp: "v=0 remote answer".into(),
        })
        .await;
    inbox
        .send(SignalingMessage::IceCandidate {
            candidate: host_candidate(7),
        })
        .await;

    let conn = party.connection();
    eventually("answer and candidate applied", || {
        conn.signaling_state() == SignalingState::Stable && conn.applied_candidates().len() == 1
    })
    .await;
    conn.emit(PeerEvent::IceConnectionState(IceState::Checking));
    conn.emit(PeerEvent::IceConnectionState(IceState::Connected));
    wait_for_status(&party.session, CallStatus::Connected).await;
    inbox
}

#[test_timeout::tokio_timeout_test(10)]
async fn start_connects_then_leave_releases_once() {
    let rig = Rig::new();
    let alice = rig.party();
    let mut events = alice.session.subscribe();

    let room = alice.session.start().await.unwrap();
    assert_eq!(alice.session.status(), CallStatus::Connecting);
    assert_eq!(alice.session.room_id(), Some(room.clone()));
    assert!(alice.session.local_stream().is_some());

    let mut inbox = connect_with_remote(&rig, &alice, &room).await;
    let conn = alice.connection();

    assert!(alice.session.leave().await);
    assert_eq!(alice.session.status(), CallStatus::Idle);
    assert_eq!(alice.session.room_id(), None);
    assert!(alice.session.local_stream().is_none());
    assert_eq!(alice.session.media().release_count(), 1);
    assert_eq!(alice.capture.live_track_count(), 0);
    assert!(conn.is_closed());
    assert_eq!(
        inbox
            .next_matching(|m| matches!(m, SignalingMessage::Hangup))
            .await,
        SignalingMessage::Hangup
    );

    let events = drain_events(&mut events);
    assert_eq!(
        status_changes(&events),
        vec![
            (CallStatus::Idle, CallStatus::Connecting),
            (CallStatus::Connecting, CallStatus::Connected),
            (CallStatus::Connected, CallStatus::Idle),
        ]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Ended {
            reason: EndReason::Local
        }
    )));
}

#[test_timeout::tokio_timeout_test(10)]
async fn concurrent_leaves_send_a_single_hangup() {
    let rig = Rig::new();
    let alice = rig.party();
    let room = alice.session.start().await.unwrap();
    let mut inbox = connect_with_remote(&rig, &alice, &room).await;

    let results = join_all((0..4).map(|_| alice.session.leave())).await;
    assert_eq!(results.iter().filter(|ended| **ended).count(), 1);
    assert!(!alice.session.leave().await);

    let hangups = inbox
        .drain_for(Duration::from_millis(200))
        .await
        .into_iter()
        .filter(|m| *m == SignalingMessage::Hangup)
        .count();
    assert_eq!(hangups, 1);
    assert_eq!(alice.session.media().release_count(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn duplicate_remote_hangup_ends_the_call_once() {
    let rig = Rig::new();
    let alice = rig.party();
    let mut events = alice.session.subscribe();
    let room = alice.session.start().await.unwrap();
    let mut inbox = connect_with_remote(&rig, &alice, &room).await;

    inbox.send(SignalingMessage::Hangup).await;
    inbox.send(SignalingMessage::Hangup).await;
    wait_for_status(&alice.session, CallStatus::Idle).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ended: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::Ended { reason } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(ended, vec![EndReason::RemoteHangup]);
    assert_eq!(alice.session.media().release_count(), 1);
    assert!(!alice.session.leave().await);

    // The remote side is never told to hang up in return.
    let echoed = inbox.drain_for(Duration::from_millis(100)).await;
    assert!(!echoed.contains(&SignalingMessage::Hangup));
}

#[test_timeout::tokio_timeout_test(10)]
async fn join_missing_room_fails_cleanly() {
    let rig = Rig::new();
    let bob = rig.party();

    let err = bob.session.join("missing-room").await.unwrap_err();
    assert_eq!(err, CallError::RoomNotFound("missing-room".into()));
    assert_eq!(bob.session.status(), CallStatus::Error);
    assert_eq!(bob.session.error(), Some(err));
    assert_eq!(bob.session.room_id(), None);
    assert_eq!(rig.bus.subscriber_count(&signaling_topic("missing-room")), 0);
    assert_eq!(bob.connector.connection_count(), 0);

    // The preview stream survives until the consumer leaves.
    assert!(bob.session.local_stream().is_some());
    assert!(bob.session.leave().await);
    assert_eq!(bob.session.status(), CallStatus::Idle);
    assert_eq!(bob.session.error(), None);
    assert_eq!(bob.capture.live_track_count(), 0);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn busy_camera_is_retried_before_starting() {
    let rig = Rig::new();
    let alice = rig.party();
    alice.capture.fail_next(CaptureKind::Camera, DeviceError::Busy);

    let started = tokio::time::Instant::now();
    let room = alice.session.start().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(alice.capture.open_count(CaptureKind::Camera), 2);
    assert_eq!(alice.session.status(), CallStatus::Connecting);
    assert_eq!(rig.rooms.room_count(), 1);
    assert_eq!(alice.session.room_id(), Some(room));
}

#[test_timeout::tokio_timeout_test(10)]
async fn denied_camera_fails_before_any_network_activity() {
    let rig = Rig::new();
    let alice = rig.party();
    alice
        .capture
        .fail_next(CaptureKind::Camera, DeviceError::PermissionDenied);

    let err = alice.session.start().await.unwrap_err();
    assert_eq!(err, CallError::Device(DeviceError::PermissionDenied));
    assert_eq!(alice.session.status(), CallStatus::Error);
    assert_eq!(rig.rooms.room_count(), 0);
    assert_eq!(alice.connector.connection_count(), 0);
    assert_eq!(alice.capture.open_count(CaptureKind::Camera), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn relay_outage_on_start_is_a_relay_error() {
    let rig = Rig::new();
    let alice = rig.party();
    rig.rooms.set_available(false);

    let err = alice.session.start().await.unwrap_err();
    assert!(matches!(err, CallError::Relay(_)));
    assert_eq!(alice.session.status(), CallStatus::Error);

    // A later attempt succeeds once the relay is back and reuses the camera.
    rig.rooms.set_available(true);
    alice.session.start().await.unwrap();
    assert_eq!(alice.capture.open_count(CaptureKind::Camera), 1);
    assert_eq!(alice.session.error(), None);
}

#[test_timeout::tokio_timeout_test(10)]
async fn stale_answer_leaves_the_call_alone() {
    let rig = Rig::new();
    let alice = rig.party();
    let room = alice.session.start().await.unwrap();
    let inbox = connect_with_remote(&rig, &alice, &room).await;
    let conn = alice.connection();

    inbox
        .send(SignalingMessage::Answer {
            sdp: "v=0 late answer".into(),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(alice.session.status(), CallStatus::Connected);
    assert_eq!(alice.session.error(), None);
    assert_eq!(conn.remote_description_sets(), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn toggles_without_a_track_are_noops() {
    let rig = Rig::new();
    let alice = rig.party_with(SyntheticCapture::new().without_video());
    alice.session.start().await.unwrap();
    let status = alice.session.status();

    assert_eq!(alice.session.toggle_video(), None);
    assert_eq!(alice.session.toggle_audio(), Some(false));
    assert_eq!(alice.session.toggle_audio(), Some(true));
    assert_eq!(alice.session.status(), status);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn leave_during_start_aborts_the_attempt() {
    let rig = Rig::new();
    let alice = rig.party_with(SyntheticCapture::new().with_open_delay(Duration::from_millis(200)));

    let session = alice.session.clone();
    let pending = tokio::spawn(async move { session.start().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.session.status(), CallStatus::Connecting);

    assert!(alice.session.leave().await);
    assert_eq!(pending.await.unwrap(), Err(CallError::Aborted));

    assert_eq!(alice.session.status(), CallStatus::Idle);
    assert_eq!(alice.session.error(), None);
    assert_eq!(alice.capture.live_track_count(), 0);
    assert_eq!(alice.session.media().release_count(), 1);
    assert_eq!(rig.rooms.room_count(), 0);
    assert_eq!(alice.connector.connection_count(), 0);
}

#[test_timeout::tokio_timeout_test(10)]
async fn second_start_while_connecting_is_rejected() {
    let rig = Rig::new();
    let alice = rig.party();
    let room = alice.session.start().await.unwrap();

    let err = alice.session.start().await.unwrap_err();
    assert!(matches!(err, CallError::InvalidState(_)));
    assert!(matches!(alice.session.join("other").await, Err(CallError::InvalidState(_))));
    assert_eq!(alice.session.room_id(), Some(room));
    assert_eq!(alice.session.status(), CallStatus::Connecting);
    assert_eq!(alice.session.error(), None);
}

#[test_timeout::tokio_timeout_test(10)]
async fn teardown_releases_without_hangup() {
    let rig = Rig::new();
    let alice = rig.party();
    let room = alice.session.start().await.unwrap();
    let mut inbox = connect_with_remote(&rig, &alice, &room).await;
    let conn = alice.connection();

    assert!(alice.session.teardown().await);
    assert!(!alice.session.leave().await);
    assert_eq!(alice.session.status(), CallStatus::Idle);
    assert!(conn.is_closed());
    assert_eq!(alice.session.media().release_count(), 1);
    let seen = inbox.drain_for(Duration::from_millis(100)).await;
    assert!(!seen.contains(&SignalingMessage::Hangup));
}

#[test_timeout::tokio_timeout_test(10)]
async fn dropping_the_session_cleans_up_quietly() {
    let rig = Rig::new();
    let alice = rig.party();
    let room = alice.session.start().await.unwrap();
    let mut inbox = connect_with_remote(&rig, &alice, &room).await;
    let conn = alice.connection();
    let capture = alice.capture.clone();

    drop(alice);
    eventually("peer connection closed", || conn.is_closed()).await;
    assert_eq!(capture.live_track_count(), 0);
    let seen = inbox.drain_for(Duration::from_millis(100)).await;
    assert!(!seen.contains(&SignalingMessage::Hangup));
}

#[test_timeout::tokio_timeout_test(10)]
async fn ice_failure_surfaces_and_renegotiation_recovers() {
    let rig = Rig::new();
    let alice = rig.party();
    let room = alice.session.start().await.unwrap();
    let mut inbox = connect_with_remote(&rig, &alice, &room).await;
    let first = alice.connection();

    first.emit(PeerEvent::ConnectionState(TransportState::Failed));
    wait_for_status(&alice.session, CallStatus::Error).await;
    assert!(matches!(
        alice.session.error(),
        Some(CallError::Negotiation(NegotiationError::ConnectionFailed(_)))
    ));

    alice.session.renegotiate().await.unwrap();
    assert_eq!(alice.session.status(), CallStatus::Connecting);
    assert_eq!(alice.session.error(), None);
    assert_eq!(alice.connector.connection_count(), 2);
    assert!(first.is_closed());
    let second = alice.connection();
    let offer = inbox.next_offer().await;
    assert_eq!(second.local_description().map(|d| d.sdp), Some(offer));

    // Late callbacks from the discarded connection change nothing.
    assert!(!first.emit(PeerEvent::ConnectionState(TransportState::Connected)));
    assert_eq!(alice.session.status(), CallStatus::Connecting);
}

#[test_timeout::tokio_timeout_test(10)]
async fn screen_share_swaps_video_and_reverts_when_capture_ends() {
    let rig = Rig::new();
    let alice = rig.party();
    let room = alice.session.start().await.unwrap();
    let _inbox = connect_with_remote(&rig, &alice, &room).await;
    let conn = alice.connection();
    let camera_audio = alice
        .session
        .local_stream()
        .and_then(|s| s.track(TrackKind::Audio).cloned())
        .unwrap();

    assert!(alice.session.toggle_screen_share().await.unwrap());
    assert!(alice.session.is_screen_sharing());
    let shared = alice.session.local_stream().unwrap();
    assert_eq!(shared.source(), CaptureKind::Screen);
    assert!(shared.track(TrackKind::Audio).unwrap().same_track(&camera_audio));
    assert_eq!(conn.replaced_tracks(), vec![TrackKind::Video, TrackKind::Audio]);
    assert_eq!(alice.session.status(), CallStatus::Connected);

    // The user stops sharing from outside the app.
    shared.track(TrackKind::Video).unwrap().stop();
    eventually("camera restored", || {
        !alice.session.is_screen_sharing()
            && alice
                .session
                .local_stream()
                .is_some_and(|s| s.source() == CaptureKind::Camera)
    })
    .await;
    assert_eq!(alice.capture.open_count(CaptureKind::Camera), 2);
    assert_eq!(alice.session.status(), CallStatus::Connected);
}

#[test_timeout::tokio_timeout_test(10)]
async fn screen_share_needs_an_active_call() {
    let rig = Rig::new();
    let alice = rig.party();
    assert!(matches!(
        alice.session.toggle_screen_share().await,
        Err(CallError::InvalidState(_))
    ));
    assert_eq!(alice.capture.open_count(CaptureKind::Screen), 0);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn leave_while_screen_capture_opens_drops_the_new_stream() {
    let rig = Rig::new();
    let alice = rig.party_with(SyntheticCapture::new().with_open_delay(Duration::from_millis(200)));
    alice.session.start().await.unwrap();

    let session = alice.session.clone();
    let toggle = tokio::spawn(async move { session.toggle_screen_share().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice.session.leave().await);

    assert_eq!(toggle.await.unwrap(), Err(CallError::Aborted));
    assert_eq!(alice.capture.open_count(CaptureKind::Screen), 1);
    assert_eq!(alice.session.status(), CallStatus::Idle);
    assert!(!alice.session.is_screen_sharing());
    assert!(alice.session.local_stream().is_none());
    assert_eq!(alice.capture.live_track_count(), 0);
    assert_eq!(alice.session.error(), None);
}
