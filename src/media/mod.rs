//! Media Module - Capture und Peer-to-Peer Aushandlung
//!
//! Dieses Modul kapselt die externen Medien-Primitive:
//! - `MediaDevices` / `LocalMedia` für Mikrofon und Kamera
//! - `NegotiationEngine` / `PeerSession` für Offer/Answer/ICE
//! - `MediaNegotiator` als Adapter mit Candidate-Puffer und Teardown
//! - `WebRtcEngine` als Implementierung über das `webrtc` Crate
//!

#[cfg(feature = "device-capture")]
mod capture;
mod negotiator;
mod webrtc_engine;

#[cfg(feature = "device-capture")]
pub use capture::CpalDevices;
pub use negotiator::{CandidateDisposition, MediaNegotiator, NegotiationRole};
pub use webrtc_engine::{default_ice_servers, is_turn_url, WebRtcEngine};

use crate::session::MediaMode;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media permission denied")]
    PermissionDenied,

    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Unexpected {0} for this negotiation state")]
    OutOfOrder(&'static str),

    #[error("Negotiation session closed")]
    Closed,
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Tracks, die ein Anruf der Art `mode` benötigt
    pub fn for_mode(mode: MediaMode) -> Vec<TrackKind> {
        match mode {
            MediaMode::Audio => vec![TrackKind::Audio],
            MediaMode::Video => vec![TrackKind::Audio, TrackKind::Video],
        }
    }
}

/// Eine laufende lokale Aufnahme. `stop` (oder Drop) gibt das Gerät frei.
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<TrackKind>;

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool);

    /// Eingangspegel (RMS, 0.0 bis 1.0); ohne Messung 0.0
    fn input_level(&self) -> f32 {
        0.0
    }

    /// Muss idempotent sein
    fn stop(&mut self);
}

/// Zugriff auf die Aufnahmegeräte
pub trait MediaDevices: Send + Sync {
    fn acquire(&self, mode: MediaMode) -> Result<Box<dyn LocalMedia>, MediaError>;
}

// ============================================================================
// PEER EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Eingehender Remote-Track
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub stream_id: String,
    pub track_id: String,
    pub codec: String,
}

/// Events einer PeerSession
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(PeerConnectionState),
    RemoteTrack(RemoteTrack),
}

/// Sink für PeerEvents; markiert jedes Event mit dem zugehörigen Anruf,
/// damit Events geschlossener Sessions verworfen werden können
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    call_id: Uuid,
    tx: mpsc::UnboundedSender<(Uuid, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(call_id: Uuid, tx: mpsc::UnboundedSender<(Uuid, PeerEvent)>) -> Self {
        Self { call_id, tx }
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send((self.call_id, event));
    }
}

// ============================================================================
// NEGOTIATION PRIMITIVE
// ============================================================================

/// Erzeugt Peer-to-Peer Sessions
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Öffnet eine Session mit lokalen Tracks der Arten `tracks`
    async fn open(
        &self,
        tracks: &[TrackKind],
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerSession>, MediaError>;
}

/// Eine Peer-to-Peer Session (Offer/Answer/ICE)
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    async fn close(&self);
}
