//! Signaling Module - WebSocket Client für den Relay-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Peer über das Relay:
//! - WebSocket-Verbindung aufbauen und halten
//! - Events signieren, serialisieren und senden
//! - Eingehende Frames parsen und weiterleiten
//!

mod client;
mod identity;
mod messages;

pub use client::{websocket_url, RelayChannel, RelayClient, RelayEvent, SignalingError};
pub use identity::{EnvelopeSigner, IdentityError};
pub use messages::*;
