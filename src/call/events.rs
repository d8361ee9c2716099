//! Events für die UI

use crate::media::RemoteTrack;
use crate::session::{CallStatus, EndReason, MediaMode};
use serde::Serialize;

/// Events die vom CallController ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CallEvent {
    /// Session hat den Status gewechselt
    #[serde(rename_all = "camelCase")]
    StateChanged {
        status: CallStatus,
        peer_id: Option<String>,
    },

    /// Eingehender Anruf
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        peer_id: String,
        peer_name: Option<String>,
        media_mode: MediaMode,
    },

    /// Gesprächsdauer (1 Hz, nur in Connected)
    DurationTick { seconds: u64 },

    /// Peer-to-Peer Medienverbindung steht
    #[serde(rename_all = "camelCase")]
    MediaConnected { peer_id: String },

    /// Remote-Track empfangen
    #[serde(rename_all = "camelCase")]
    RemoteStream { peer_id: String, track: RemoteTrack },

    /// Mikrofon/Kamera umgeschaltet
    #[serde(rename_all = "camelCase")]
    MediaToggled {
        audio_enabled: bool,
        video_enabled: bool,
    },

    #[serde(rename_all = "camelCase")]
    CallEnded { peer_id: String, reason: EndReason },

    /// Fehler, für den Benutzer sichtbar
    #[serde(rename_all = "camelCase")]
    CallFailed {
        peer_id: Option<String>,
        message: String,
    },
}
