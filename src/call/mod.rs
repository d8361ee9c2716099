//! Call Module - Orchestrierung eines Anrufs
//!
//! Dieses Modul verbindet Session, Relay und Medien:
//! - `CallController` als Task, der die Session besitzt
//! - `CallHandle` für UI-Befehle und Events
//! - `CallRecorder` für Anruf-Einträge beim Backend
//!

mod controller;
mod events;
mod records;

pub use controller::{
    CallController, CallDeps, CallError, CallHandle, ControllerSettings,
    DEFAULT_NEGOTIATION_TIMEOUT, DEFAULT_RING_TIMEOUT,
};
pub use events::CallEvent;
pub use records::{CallRecorder, HttpCallRecorder, RecordError};
