//! Call Session State Machine
//!
//! Die Session wird ausschließlich vom CallController besessen und nur über
//! die Übergangsmethoden verändert. Ungültige Übergänge lassen den Zustand
//! unverändert und liefern einen `TransitionError`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} is not allowed while {status}")]
pub struct TransitionError {
    pub operation: &'static str,
    pub status: CallStatus,
}

// ============================================================================
// ENUMS
// ============================================================================

/// Medienart eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaMode {
    Audio,
    Video,
}

impl MediaMode {
    pub fn has_video(self) -> bool {
        matches!(self, MediaMode::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaMode::Audio => "audio",
            MediaMode::Video => "video",
        }
    }
}

impl fmt::Display for MediaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status der lokalen Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf klingelt beim Peer
    Outgoing,
    /// Eingehender Anruf wartet auf Antwort
    Incoming,
    /// Anruf angenommen, Medien werden ausgehandelt oder fließen
    Connected,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Idle => "idle",
            CallStatus::Outgoing => "outgoing",
            CallStatus::Incoming => "incoming",
            CallStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Fortschritt der Medien-Aushandlung innerhalb von Connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationPhase {
    /// Noch nicht angenommen
    NotStarted,
    /// Angerufener wartet auf das Offer des Anrufers
    AwaitingOffer,
    OfferSent,
    AnswerSent,
    /// Medienverbindung steht
    Established,
}

/// Grund für das Ende einer Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    /// Ausgehender Anruf lokal abgebrochen
    Cancelled,
    /// Eingehender Anruf lokal abgelehnt
    Declined,
    /// Lokal aufgelegt
    HungUp,
    /// Peer hat abgelehnt
    RejectedByPeer { reason: Option<String> },
    /// Peer hat aufgelegt bzw. abgebrochen
    EndedByPeer,
    /// Ausgehender Anruf wurde nicht angenommen
    NoAnswer,
    /// Eingehender Anruf wurde nicht rechtzeitig angenommen
    Missed,
    Failed { message: String },
}

impl EndReason {
    pub fn status_message(&self) -> &str {
        match self {
            EndReason::Cancelled => "Call cancelled",
            EndReason::Declined => "Call declined",
            EndReason::HungUp | EndReason::EndedByPeer => "Call ended",
            EndReason::RejectedByPeer { .. } => "Call rejected",
            EndReason::NoAnswer => "No answer",
            EndReason::Missed => "Missed call",
            EndReason::Failed { message } => message,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, EndReason::Failed { .. })
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Lokale Repräsentation eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSession {
    call_id: Option<Uuid>,
    status: CallStatus,
    peer_id: Option<String>,
    peer_name: Option<String>,
    media_mode: MediaMode,
    direction: Option<CallDirection>,
    started_at: Option<DateTime<Utc>>,
    duration_seconds: u64,
    phase: NegotiationPhase,
    audio_enabled: bool,
    video_enabled: bool,
}

impl Default for CallSession {
    fn default() -> Self {
        Self::idle()
    }
}

impl CallSession {
    pub fn idle() -> Self {
        Self {
            call_id: None,
            status: CallStatus::Idle,
            peer_id: None,
            peer_name: None,
            media_mode: MediaMode::Audio,
            direction: None,
            started_at: None,
            duration_seconds: 0,
            phase: NegotiationPhase::NotStarted,
            audio_enabled: true,
            video_enabled: false,
        }
    }

    pub fn call_id(&self) -> Option<Uuid> {
        self.call_id
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    pub fn media_mode(&self) -> MediaMode {
        self.media_mode
    }

    pub fn direction(&self) -> Option<CallDirection> {
        self.direction
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn duration_seconds(&self) -> u64 {
        self.duration_seconds
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn is_idle(&self) -> bool {
        self.status == CallStatus::Idle
    }

    /// Prüft ob `peer_id` der Gegenstelle der aktiven Session entspricht
    pub fn is_peer(&self, peer_id: &str) -> bool {
        self.peer_id.as_deref() == Some(peer_id)
    }

    /// Liefert einen Fehler wenn die Session nicht in `expected` ist
    pub fn ensure(
        &self,
        expected: CallStatus,
        operation: &'static str,
    ) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionError {
                operation,
                status: self.status,
            })
        }
    }

    /// Idle → Outgoing
    pub fn begin_outgoing(
        &mut self,
        peer_id: String,
        media_mode: MediaMode,
    ) -> Result<Uuid, TransitionError> {
        self.ensure(CallStatus::Idle, "initiate_call")?;
        Ok(self.begin(peer_id, None, media_mode, CallDirection::Outbound, CallStatus::Outgoing))
    }

    /// Idle → Incoming
    pub fn begin_incoming(
        &mut self,
        peer_id: String,
        peer_name: Option<String>,
        media_mode: MediaMode,
    ) -> Result<Uuid, TransitionError> {
        self.ensure(CallStatus::Idle, "receive_call_request")?;
        Ok(self.begin(
            peer_id,
            peer_name,
            media_mode,
            CallDirection::Inbound,
            CallStatus::Incoming,
        ))
    }

    fn begin(
        &mut self,
        peer_id: String,
        peer_name: Option<String>,
        media_mode: MediaMode,
        direction: CallDirection,
        status: CallStatus,
    ) -> Uuid {
        let call_id = Uuid::new_v4();
        *self = Self {
            call_id: Some(call_id),
            status,
            peer_id: Some(peer_id),
            peer_name,
            media_mode,
            direction: Some(direction),
            video_enabled: media_mode.has_video(),
            ..Self::idle()
        };
        call_id
    }

    /// Outgoing/Incoming → Connected, Dauerzähler startet bei 0
    pub fn connect(&mut self) -> Result<(), TransitionError> {
        let phase = match self.status {
            CallStatus::Outgoing => NegotiationPhase::NotStarted,
            CallStatus::Incoming => NegotiationPhase::AwaitingOffer,
            status => {
                return Err(TransitionError {
                    operation: "connect",
                    status,
                })
            }
        };
        self.status = CallStatus::Connected;
        self.started_at = Some(Utc::now());
        self.duration_seconds = 0;
        self.phase = phase;
        Ok(())
    }

    pub fn set_phase(&mut self, phase: NegotiationPhase) {
        if self.status == CallStatus::Connected {
            self.phase = phase;
        }
    }

    /// Zählt eine Sekunde hoch (nur in Connected)
    pub fn tick(&mut self) -> Option<u64> {
        if self.status != CallStatus::Connected {
            return None;
        }
        self.duration_seconds += 1;
        Some(self.duration_seconds)
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled && self.media_mode.has_video();
    }

    /// Setzt die Session auf Idle zurück und gibt den vorherigen Stand zurück
    pub fn reset(&mut self) -> CallSession {
        std::mem::take(self)
    }
}

/// Formatiert Sekunden als `mm:ss`
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

// ============================================================================
// TESTS
// ============================================================================
