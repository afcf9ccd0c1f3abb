use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use super::{
    IceState, PeerConnection, PeerConnector, PeerEvent, PeerEventSink, RemoteTrack, SdpKind,
    SessionDescription, SignalingState, TransportState,
};
use crate::config::{CallConfig, IceServer};
use crate::error::PeerError;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::IceCandidate;

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| PeerError::new("register_codecs", err))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|err| PeerError::new("register_interceptors", err))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    match state {
        RTCIceConnectionState::New => Some(IceState::New),
        RTCIceConnectionState::Checking => Some(IceState::Checking),
        RTCIceConnectionState::Connected => Some(IceState::Connected),
        RTCIceConnectionState::Completed => Some(IceState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceState::Failed),
        RTCIceConnectionState::Closed => Some(IceState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        RTPCodecType::Unspecified => None,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(|err| PeerError::new("parse_description", err))
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, PeerError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(PeerError::new(
            "read_description",
            format!("unexpected sdp type {other}"),
        )),
    }
}

/// Builds `webrtc` peer connections from the call's ICE settings.
pub struct RtcConnector {
    ice_servers: Vec<IceServer>,
    ice_candidate_pool_size: u8,
}

impl RtcConnector {
    pub fn new(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
        }
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(rtc_ice_server).collect(),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let api = build_api()?;
        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(|err| PeerError::new("new_peer_connection", err))?,
        );
        install_handlers(&pc, &events);
        debug!(
            link_id = events.link_id(),
            ice_servers = self.ice_servers.len(),
            "webrtc peer connection created"
        );
        Ok(Arc::new(RtcPeerConnection {
            pc,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: &PeerEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                trace!(link_id = sink.link_id(), "ice gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => {
                    debug!(link_id = sink.link_id(), error = %err, "failed to serialize local candidate");
                }
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let sink = sink.clone();
        Box::pin(async move {
            trace!(link_id = sink.link_id(), ?state, "peer connection state changed");
            if let Some(state) = transport_state(state) {
                sink.emit(PeerEvent::ConnectionState(state));
            }
        })
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state| {
        let sink = sink.clone();
        Box::pin(async move {
            trace!(link_id = sink.link_id(), ?state, "ice connection state changed");
            if let Some(state) = ice_state(state) {
                sink.emit(PeerEvent::IceConnectionState(state));
            }
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(kind) = track_kind(track.kind()) else {
                return;
            };
            sink.emit(PeerEvent::Track(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                rtc: Some(track),
            }));
        })
    }));
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<(TrackKind, Arc<RTCRtpSender>)>>,
}

impl RtcPeerConnection {
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let sender = self
            .pc
            .add_track(track.rtc_track())
            .await
            .map_err(|err| PeerError::new("add_track", err))?;
        self.senders.lock().push((track.kind(), sender));
        Ok(())
    }

    async fn replace_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .iter()
            .find(|(kind, _)| *kind == track.kind())
            .map(|(_, sender)| sender.clone());
        let Some(sender) = sender else {
            return Err(PeerError::new(
                "replace_track",
                format!("no {} sender", track.kind()),
            ));
        };
        sender
            .replace_track(Some(track.rtc_track()))
            .await
            .map_err(|err| PeerError::new("replace_track", err))
    }

    fn sender_kinds(&self) -> Vec<TrackKind> {
        self.senders.lock().iter().map(|(kind, _)| *kind).collect()
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| PeerError::new("create_offer", err))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| PeerError::new("create_answer", err))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|err| PeerError::new("set_local_description", err))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|err| PeerError::new("set_remote_description", err))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| PeerError::new("add_ice_candidate", err))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(|err| PeerError::new("close", err))
    }
}
