//! Ringwire - Call Signaling Orchestrator
//!
//! Koordiniert Eins-zu-eins Sprach- und Videoanrufe zwischen zwei Peers:
//! - Zustandsmaschine einer Call-Session (Idle, Outgoing, Incoming, Connected)
//! - WebSocket-Relay für Call-Control und Offer/Answer/ICE
//! - WebRTC für die Peer-to-Peer Medienverbindung
//! - Ed25519-signierte Envelopes

pub mod call;
pub mod config;
pub mod media;
pub mod session;
pub mod signaling;

pub use call::{
    CallController, CallDeps, CallError, CallEvent, CallHandle, CallRecorder,
    ControllerSettings, HttpCallRecorder,
};
pub use config::{ClientConfig, ConfigError};
pub use session::{format_duration, CallSession, CallStatus, EndReason, MediaMode};

use anyhow::Context;
use media::{MediaDevices, WebRtcEngine};
use signaling::{EnvelopeSigner, RelayClient};
use std::sync::Arc;

/// Standard-Filter wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_DIRECTIVES: &str = "ringwire=debug,webrtc=warn";

/// Initialisiert das Logging (mehrfacher Aufruf ist harmlos)
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_DIRECTIVES));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// APPLICATION
// ============================================================================

/// Verdrahtet Relay-Client, WebRTC-Engine und CallController
pub struct CallApp {
    config: ClientConfig,
    relay: Arc<RelayClient>,
    calls: CallHandle,
}

impl CallApp {
    /// Verbindet mit dem Relay und startet den CallController
    pub async fn start(
        config: ClientConfig,
        devices: Arc<dyn MediaDevices>,
    ) -> anyhow::Result<Self> {
        init_tracing();
        tracing::info!("Starting ringwire client: {:?}", config);

        let signer = match &config.signing_key {
            Some(seed) => {
                EnvelopeSigner::from_seed_base64(seed).context("Invalid CALL_SIGNING_KEY")?
            }
            None => EnvelopeSigner::generate(),
        };
        tracing::info!("Loaded signing key: {:?}", signer);

        let relay = Arc::new(RelayClient::new(
            config.signaling_url.clone(),
            config.user_id.clone(),
            Arc::new(signer),
        ));

        let recorder: Option<Arc<dyn CallRecorder>> = match &config.api_url {
            Some(url) => Some(Arc::new(
                HttpCallRecorder::new(url, config.api_token.clone())
                    .context("Invalid CALL_API_URL")?,
            )),
            None => None,
        };

        let settings = ControllerSettings {
            local_id: config.user_id.clone(),
            display_name: Some(config.display_name.clone()),
            ring_timeout: config.ring_timeout,
            negotiation_timeout: config.negotiation_timeout,
        };
        let mut engine = WebRtcEngine::new(&config.ice_servers);
        if let (Some(username), Some(credential)) =
            (&config.turn_username, &config.turn_credential)
        {
            engine = engine.with_turn_credentials(username.clone(), credential.clone());
        }

        let deps = CallDeps {
            relay: relay.clone(),
            engine: Arc::new(engine),
            devices,
            recorder,
        };

        // Controller abonniert den Relay vor dem Verbindungsaufbau
        let calls = CallController::spawn(settings, deps);

        relay
            .connect()
            .await
            .context("Failed to connect to relay server")?;
        relay.start_heartbeat(config.heartbeat_interval);

        tracing::info!("Online as {}", config.user_id);
        Ok(Self {
            config,
            relay,
            calls,
        })
    }

    /// Wie `start`, mit dem Standard-Mikrofon über cpal
    #[cfg(feature = "device-capture")]
    pub async fn start_with_default_devices(config: ClientConfig) -> anyhow::Result<Self> {
        Self::start(config, Arc::new(media::CpalDevices::new())).await
    }

    pub fn calls(&self) -> &CallHandle {
        &self.calls
    }

    pub fn relay(&self) -> &Arc<RelayClient> {
        &self.relay
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Beendet einen laufenden Anruf und trennt vom Relay
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.calls
            .shutdown()
            .await
            .context("Failed to stop call controller")?;
        self.relay.disconnect();
        tracing::info!("Ringwire client stopped");
        Ok(())
    }
}
