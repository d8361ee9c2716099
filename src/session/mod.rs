//! Session Module - Zustand eines Anrufs
//!
//! Dieses Modul enthält die reine Zustandsmaschine eines Anrufs:
//! - Idle → Outgoing → Connected → Idle (Anrufer)
//! - Idle → Incoming → Connected → Idle oder Incoming → Idle (Angerufener)
//! - Gesprächsdauer und Medien-Schalter
//!

mod state;

pub use state::{
    format_duration, CallDirection, CallSession, CallStatus, EndReason, MediaMode,
    NegotiationPhase, TransitionError,
};
