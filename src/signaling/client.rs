//! WebSocket Client für den Relay-Server
//!
//! Verwaltet die persistente Verbindung zum Relay:
//! - Präsenz-Meldung und Heartbeat
//! - Signierte, serialisierte SignalingEvents senden
//! - Eingehende Frames parsen und an Subscriber verteilen
//!
//! Keine automatische Reconnection: ein Verbindungsabbruch wird als
//! `RelayEvent::Disconnected` gemeldet.

use super::identity::EnvelopeSigner;
use super::messages::{decode_frame, Frame, SignalingEvent};
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Unknown relay event: {0}")]
    UnknownEvent(String),

    #[error("Malformed relay message: {0}")]
    Malformed(String),
}

// ============================================================================
// RELAY EVENTS
// ============================================================================

/// Events die vom Relay-Kanal ausgelöst werden
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Verbunden mit dem Relay-Server
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Signaling-Event vom Peer (oder vom Relay selbst)
    Signal(SignalingEvent),
}

/// Schnittstelle zum Relay-Kanal, gegen die der CallController arbeitet
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Sendet ein Event an `event.to`
    async fn send(&self, event: SignalingEvent) -> Result<(), SignalingError>;

    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<RelayEvent>;

    fn is_connected(&self) -> bool;
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

// ============================================================================
// RELAY CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct RelayClient {
    server_url: String,
    local_id: String,
    signer: Arc<EnvelopeSigner>,
    state: Arc<RwLock<ClientState>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: broadcast::Sender<RelayEvent>,
}

impl RelayClient {
    /// Erstellt einen neuen RelayClient
    pub fn new(server_url: String, local_id: String, signer: Arc<EnvelopeSigner>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            local_id,
            signer,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: RwLock::new(None),
            event_tx,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn public_key_base64(&self) -> String {
        self.signer.public_key_base64()
    }

    /// Verbindet mit dem Relay-Server und meldet den Benutzer online
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let ws_url = websocket_url(&self.server_url)?;

        tracing::info!("Connecting to relay server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.write() = Some(tx);

        self.state.write().is_connected = true;
        let _ = self.event_tx.send(RelayEvent::Connected);

        // Read-Task
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => Self::handle_frame(&text, &event_tx),
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx.send(RelayEvent::Disconnected);
        });

        // Write-Task
        let state_clone = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    state_clone.write().is_connected = false;
                    break;
                }
            }
            let _ = write.close().await;
        });

        self.send_frame(Frame::user_online(&self.local_id)).await
    }

    /// Trennt die Verbindung (der Write-Task schließt den Socket)
    pub fn disconnect(&self) {
        self.tx.write().take();
        self.state.write().is_connected = false;
    }

    /// Sendet einen Heartbeat
    pub async fn send_heartbeat(&self) -> Result<(), SignalingError> {
        self.send_frame(Frame::heartbeat(&self.local_id)).await
    }

    /// Startet einen Heartbeat-Task, der endet sobald die Verbindung weg ist
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !client.is_connected() {
                    tracing::info!("Heartbeat: relay disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = client.send_heartbeat().await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    /// Versieht den Frame mit Zeitstempel und Signatur
    fn encode(&self, frame: Frame) -> Result<String, SignalingError> {
        let mut signable = serde_json::to_value(&frame)
            .map_err(|e| SignalingError::Encode(e.to_string()))?;

        if let Some(obj) = signable.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::Number(Utc::now().timestamp_millis().into()),
            );
            obj.remove("signature");
        }
        let signature = self.signer.sign_frame(&signable);

        if let Some(obj) = signable.as_object_mut() {
            obj.insert(
                "signature".to_string(),
                serde_json::Value::String(signature),
            );
        }

        serde_json::to_string(&signable).map_err(|e| SignalingError::Encode(e.to_string()))
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), SignalingError> {
        let tx = self.tx.read().clone().ok_or(SignalingError::NotConnected)?;
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = self.encode(frame)?;
        tx.send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet einen eingehenden Text-Frame
    fn handle_frame(text: &str, event_tx: &broadcast::Sender<RelayEvent>) {
        match decode_frame(text) {
            Ok(event) => {
                tracing::debug!(
                    "Relay event {} from {}",
                    event.kind().event_name(),
                    event.from
                );
                let _ = event_tx.send(RelayEvent::Signal(event));
            }
            Err(SignalingError::UnknownEvent(name)) => {
                // Chat-, Typing- und Presence-Events gehören nicht zum Anruf
                tracing::trace!("Ignoring relay event {}", name);
            }
            Err(e) => {
                tracing::warn!("Dropping relay frame: {}", e);
            }
        }
    }
}

#[async_trait]
impl RelayChannel for RelayClient {
    async fn send(&self, event: SignalingEvent) -> Result<(), SignalingError> {
        tracing::debug!("Sending {} to {}", event.kind().event_name(), event.to);
        self.send_frame(event.to_frame()?).await
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("server_url", &self.server_url)
            .field("local_id", &self.local_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Bildet `http(s)://` auf `ws(s)://` ab, andere Schemata bleiben unverändert
pub fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => return Err(SignalingError::InvalidUrl(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(server_url.to_string()))?;
    Ok(url)
}

// ============================================================================
// TESTS
// ============================================================================
