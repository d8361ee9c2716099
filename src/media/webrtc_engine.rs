//! WebRTC Negotiation Engine
//!
//! Implementiert `NegotiationEngine` über das `webrtc` Crate. Jede Session
//! bekommt eine eigene RTCPeerConnection mit lokalen Tracks (Opus, bei
//! Video zusätzlich VP8). Die Callbacks der Peer Connection werden in
//! `PeerEvent`s übersetzt.

use super::{
    MediaError, NegotiationEngine, PeerConnectionState, PeerEvent, PeerEventSink, PeerSession,
    RemoteTrack, TrackKind,
};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Sample Rate für Opus
const AUDIO_CLOCK_RATE: u32 = 48000;

/// RTP Clock Rate für Video
const VIDEO_CLOCK_RATE: u32 = 90000;

const STREAM_ID: &str = "ringwire";

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

/// TURN braucht Credentials, STUN nicht
pub fn is_turn_url(url: &str) -> bool {
    url.starts_with("turn:") || url.starts_with("turns:")
}

// ============================================================================
// ENGINE
// ============================================================================

/// WebRTC Engine
#[derive(Debug, Clone)]
pub struct WebRtcEngine {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngine {
    /// STUN URLs landen in einem Eintrag, `turn:`/`turns:` URLs in einem
    /// eigenen (Credentials über `with_turn_credentials`)
    pub fn new(ice_urls: &[String]) -> Self {
        let (turn, stun): (Vec<String>, Vec<String>) =
            ice_urls.iter().cloned().partition(|url| is_turn_url(url));

        let mut ice_servers = Vec::new();
        if !stun.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: stun,
                ..Default::default()
            });
        }
        if !turn.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: turn,
                ..Default::default()
            });
        }
        Self { ice_servers }
    }

    /// Setzt Username und Credential für alle TURN-Einträge
    pub fn with_turn_credentials(mut self, username: String, credential: String) -> Self {
        for server in &mut self.ice_servers {
            if server.urls.iter().any(|url| is_turn_url(url)) {
                server.username = username.clone();
                server.credential = credential.clone();
            }
        }
        self
    }

    pub fn ice_servers(&self) -> &[RTCIceServer] {
        &self.ice_servers
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;

        Ok(Arc::new(pc))
    }
}

impl Default for WebRtcEngine {
    fn default() -> Self {
        Self::new(&default_ice_servers())
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn open(
        &self,
        tracks: &[TrackKind],
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerSession>, MediaError> {
        let pc = self.create_peer_connection().await?;
        install_handlers(&pc, events);

        let mut local_tracks = Vec::with_capacity(tracks.len());
        for kind in tracks {
            let track = Arc::new(local_track(*kind));
            if let Err(e) = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                let _ = pc.close().await;
                return Err(MediaError::Negotiation(e.to_string()));
            }
            local_tracks.push(track);
        }

        Ok(Box::new(WebRtcSession { pc, local_tracks }))
    }
}

fn local_track(kind: TrackKind) -> TrackLocalStaticRTP {
    let (capability, id) = match kind {
        TrackKind::Audio => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: 2,
                ..Default::default()
            },
            "audio",
        ),
        TrackKind::Video => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
            "video",
        ),
    };
    TrackLocalStaticRTP::new(capability, id.to_string(), STREAM_ID.to_string())
}

/// Registriert Event Handler für die Peer Connection
fn install_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSink) {
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let state = match s {
            RTCPeerConnectionState::New => Some(PeerConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
            _ => None,
        };
        if let Some(state) = state {
            sink.emit(PeerEvent::StateChanged(state));
        }

        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        let remote = RemoteTrack {
            kind,
            stream_id: track.stream_id(),
            track_id: track.id(),
            codec: track.codec().capability.mime_type,
        };
        tracing::info!("Received remote track: {:?}", remote);
        sink.emit(PeerEvent::RemoteTrack(remote));
        Box::pin(async {})
    }));
}

// ============================================================================
// SESSION
// ============================================================================

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    #[allow(dead_code)]
    local_tracks: Vec<Arc<TrackLocalStaticRTP>>,
}

#[async_trait]
impl PeerSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let remote = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::Negotiation(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
