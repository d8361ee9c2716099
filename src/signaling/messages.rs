//! Message Types für das Relay-Protokoll
//!
//! Jedes Event wird als JSON-Text-Frame übertragen:
//! `{ "event", "from", "to", "payload", "timestamp", "signature" }`.
//! Die Event-Namen entsprechen denen des Relay-Servers.

use super::client::SignalingError;
use crate::session::MediaMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// EVENT KINDS
// ============================================================================

/// Art eines Signaling-Events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    CallRequest,
    CallAccept,
    CallReject,
    CallEnd,
    CallFailed,
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub const ALL: [SignalKind; 8] = [
        SignalKind::CallRequest,
        SignalKind::CallAccept,
        SignalKind::CallReject,
        SignalKind::CallEnd,
        SignalKind::CallFailed,
        SignalKind::Offer,
        SignalKind::Answer,
        SignalKind::IceCandidate,
    ];

    /// Event-Name auf dem Relay-Kanal
    pub fn event_name(self) -> &'static str {
        match self {
            SignalKind::CallRequest => "callUser",
            SignalKind::CallAccept => "callAccepted",
            SignalKind::CallReject => "callRejected",
            SignalKind::CallEnd => "callEnded",
            SignalKind::CallFailed => "callFailed",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.event_name() == name)
    }

    /// Offer, Answer und ICE Candidates gehören zur Medien-Aushandlung
    pub fn is_negotiation(self) -> bool {
        matches!(
            self,
            SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate
        )
    }
}

// ============================================================================
// PAYLOAD TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP Beschreibung (kompatibel zu `RTCSessionDescriptionInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate (kompatibel zu `RTCIceCandidateInit`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallRequestBody {
    call_type: MediaMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReasonBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailureBody {
    #[serde(default)]
    message: String,
}

/// Typisierter Inhalt eines Signaling-Events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    CallRequest {
        media_mode: MediaMode,
        caller_name: Option<String>,
    },
    CallAccept,
    CallReject {
        reason: Option<String>,
    },
    CallEnd {
        reason: Option<String>,
    },
    CallFailed {
        message: String,
    },
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::CallRequest { .. } => SignalKind::CallRequest,
            SignalPayload::CallAccept => SignalKind::CallAccept,
            SignalPayload::CallReject { .. } => SignalKind::CallReject,
            SignalPayload::CallEnd { .. } => SignalKind::CallEnd,
            SignalPayload::CallFailed { .. } => SignalKind::CallFailed,
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }

    fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            SignalPayload::CallRequest {
                media_mode,
                caller_name,
            } => serde_json::to_value(CallRequestBody {
                call_type: *media_mode,
                name: caller_name.clone(),
            }),
            SignalPayload::CallAccept => Ok(Value::Object(Default::default())),
            SignalPayload::CallReject { reason } | SignalPayload::CallEnd { reason } => {
                serde_json::to_value(ReasonBody {
                    reason: reason.clone(),
                })
            }
            SignalPayload::CallFailed { message } => serde_json::to_value(FailureBody {
                message: message.clone(),
            }),
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => serde_json::to_value(desc),
            SignalPayload::IceCandidate(candidate) => serde_json::to_value(candidate),
        }
    }

    fn from_json(kind: SignalKind, value: Value) -> Result<Self, serde_json::Error> {
        // Der Relay-Server schickt bei leeren Payloads teils `null`
        let value = match value {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        Ok(match kind {
            SignalKind::CallRequest => {
                let body: CallRequestBody = serde_json::from_value(value)?;
                SignalPayload::CallRequest {
                    media_mode: body.call_type,
                    caller_name: body.name,
                }
            }
            SignalKind::CallAccept => SignalPayload::CallAccept,
            SignalKind::CallReject => SignalPayload::CallReject {
                reason: serde_json::from_value::<ReasonBody>(value)?.reason,
            },
            SignalKind::CallEnd => SignalPayload::CallEnd {
                reason: serde_json::from_value::<ReasonBody>(value)?.reason,
            },
            SignalKind::CallFailed => SignalPayload::CallFailed {
                message: serde_json::from_value::<FailureBody>(value)?.message,
            },
            SignalKind::Offer => SignalPayload::Offer(serde_json::from_value(value)?),
            SignalKind::Answer => SignalPayload::Answer(serde_json::from_value(value)?),
            SignalKind::IceCandidate => {
                SignalPayload::IceCandidate(serde_json::from_value(value)?)
            }
        })
    }
}

// ============================================================================
// SIGNALING EVENT
// ============================================================================

/// Ein Call-Control- oder Aushandlungs-Event zwischen zwei Peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEvent {
    pub from: String,
    pub to: String,
    pub payload: SignalPayload,
}

impl SignalingEvent {
    pub fn new(from: impl Into<String>, to: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    /// Wandelt das Event in einen unsignierten Frame um
    pub fn to_frame(&self) -> Result<Frame, SignalingError> {
        let payload = self
            .payload
            .to_json()
            .map_err(|e| SignalingError::Encode(e.to_string()))?;
        Ok(Frame {
            event: self.kind().event_name().to_string(),
            from: self.from.clone(),
            to: self.to.clone(),
            payload,
            timestamp: None,
            signature: None,
        })
    }
}

impl TryFrom<Frame> for SignalingEvent {
    type Error = SignalingError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let kind = SignalKind::from_event_name(&frame.event)
            .ok_or_else(|| SignalingError::UnknownEvent(frame.event.clone()))?;
        let payload = SignalPayload::from_json(kind, frame.payload)
            .map_err(|e| SignalingError::Malformed(format!("{}: {}", frame.event, e)))?;
        Ok(Self {
            from: frame.from,
            to: frame.to,
            payload,
        })
    }
}

// ============================================================================
// WIRE FRAME
// ============================================================================

/// JSON-Frame auf dem Relay-Kanal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Frame {
    /// Präsenz-Meldung nach dem Verbindungsaufbau
    pub fn user_online(user_id: &str) -> Self {
        Self::control("userOnline", user_id)
    }

    /// Heartbeat
    pub fn heartbeat(user_id: &str) -> Self {
        Self::control("heartbeat", user_id)
    }

    fn control(event: &str, user_id: &str) -> Self {
        Self {
            event: event.to_string(),
            from: user_id.to_string(),
            to: String::new(),
            payload: serde_json::json!({ "userId": user_id }),
            timestamp: None,
            signature: None,
        }
    }
}

/// Parst einen eingehenden Text-Frame
pub fn decode_frame(text: &str) -> Result<SignalingEvent, SignalingError> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))?;
    SignalingEvent::try_from(frame)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_unique() {
        for kind in SignalKind::ALL {
            assert_eq!(SignalKind::from_event_name(kind.event_name()), Some(kind));
        }
        assert_eq!(SignalKind::from_event_name("receiveMessage"), None);
    }

    #[test]
    fn test_call_request_frame() {
        let event = SignalingEvent::new(
            "alice",
            "bob",
            SignalPayload::CallRequest {
                media_mode: MediaMode::Video,
                caller_name: Some("Alice".to_string()),
            },
        );
        let frame = event.to_frame().unwrap();

        assert_eq!(frame.event, "callUser");
        assert_eq!(
            frame.payload,
            serde_json::json!({ "callType": "video", "name": "Alice" })
        );
    }

    #[test]
    fn test_decode_ice_candidate() {
        let text = r#"{
            "event": "ice-candidate",
            "from": "bob",
            "to": "alice",
            "payload": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        }"#;

        let event = decode_frame(text).unwrap();
        assert_eq!(event.kind(), SignalKind::IceCandidate);
        match event.payload {
            SignalPayload::IceCandidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
                assert!(c.username_fragment.is_none());
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_decode_accept_with_null_payload() {
        let text = r#"{"event":"callAccepted","from":"bob","to":"alice","payload":null}"#;
        let event = decode_frame(text).unwrap();
        assert_eq!(event.payload, SignalPayload::CallAccept);

        let text = r#"{"event":"callRejected","from":"bob","to":"alice"}"#;
        let event = decode_frame(text).unwrap();
        assert_eq!(event.payload, SignalPayload::CallReject { reason: None });
    }

    #[test]
    fn test_decode_unknown_event() {
        let text = r#"{"event":"userTyping","from":"bob","to":"alice"}"#;
        assert!(matches!(
            decode_frame(text),
            Err(SignalingError::UnknownEvent(name)) if name == "userTyping"
        ));
    }

    #[test]
    fn test_decode_malformed_offer() {
        let text = r#"{"event":"offer","from":"bob","to":"alice","payload":{"sdp":42}}"#;
        assert!(matches!(
            decode_frame(text),
            Err(SignalingError::Malformed(_))
        ));
    }

    #[test]
    fn test_negotiation_kinds() {
        assert!(SignalKind::Offer.is_negotiation());
        assert!(SignalKind::IceCandidate.is_negotiation());
        assert!(!SignalKind::CallAccept.is_negotiation());
    }
}
