//! Konfiguration
//!
//! Wird aus Umgebungsvariablen geladen. Token und Signing-Key erscheinen
//! nicht im Debug-Output.

use crate::media::{default_ice_servers, is_turn_url};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3000";

pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 15;

/// Heartbeat-Intervall, damit der Relay die Verbindung nicht als idle schließt
pub const DEFAULT_HEARTBEAT_SECS: u64 = 25;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },
}

/// Client-Konfiguration
#[derive(Clone)]
pub struct ClientConfig {
    /// Relay-Server URL (`http(s)` wird auf `ws(s)` abgebildet)
    pub signaling_url: String,

    /// Eigene Benutzer-ID
    pub user_id: String,

    /// Anzeigename für Anrufanfragen (Standard: Benutzer-ID)
    pub display_name: String,

    pub ring_timeout: Duration,

    pub negotiation_timeout: Duration,

    pub heartbeat_interval: Duration,

    /// STUN/TURN URLs
    pub ice_servers: Vec<String>,

    /// Pflicht sobald eine `turn:`/`turns:` URL konfiguriert ist
    pub turn_username: Option<String>,

    pub turn_credential: Option<String>,

    /// REST-Basis für Anruf-Einträge; ohne wird nichts aufgezeichnet
    pub api_url: Option<String>,

    pub api_token: Option<String>,

    /// Base64 Ed25519 Seed; ohne wird pro Start ein Schlüssel erzeugt
    pub signing_key: Option<String>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("signaling_url", &self.signaling_url)
            .field("user_id", &self.user_id)
            .field("display_name", &self.display_name)
            .field("ring_timeout", &self.ring_timeout)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("ice_servers", &self.ice_servers)
            .field("turn_username", &self.turn_username)
            .field(
                "turn_credential",
                &self.turn_credential.as_ref().map(|_| "[REDACTED]"),
            )
            .field("api_url", &self.api_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("signing_key", &self.signing_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ClientConfig {
    /// Lädt die Konfiguration aus den Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Lädt die Konfiguration aus einer Map (für Tests)
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let user_id = non_empty(vars, "CALL_USER_ID")
            .ok_or_else(|| ConfigError::MissingEnvVar("CALL_USER_ID".to_string()))?;

        let signaling_url = non_empty(vars, "SIGNALING_URL")
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());

        let display_name = non_empty(vars, "CALL_DISPLAY_NAME").unwrap_or_else(|| user_id.clone());

        let ring_timeout = seconds(vars, "CALL_RING_TIMEOUT_SECS", DEFAULT_RING_TIMEOUT_SECS)?;
        let negotiation_timeout = seconds(
            vars,
            "CALL_NEGOTIATION_TIMEOUT_SECS",
            DEFAULT_NEGOTIATION_TIMEOUT_SECS,
        )?;
        let heartbeat_interval = seconds(vars, "CALL_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)?;

        let ice_servers = match non_empty(vars, "CALL_ICE_SERVERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => default_ice_servers(),
        };

        let turn_username = non_empty(vars, "CALL_TURN_USERNAME");
        let turn_credential = non_empty(vars, "CALL_TURN_CREDENTIAL");
        let has_turn = ice_servers.iter().any(|url| is_turn_url(url));
        if has_turn && turn_username.is_none() {
            return Err(ConfigError::MissingEnvVar("CALL_TURN_USERNAME".to_string()));
        }
        if has_turn && turn_credential.is_none() {
            return Err(ConfigError::MissingEnvVar("CALL_TURN_CREDENTIAL".to_string()));
        }

        Ok(Self {
            signaling_url,
            user_id,
            display_name,
            ring_timeout,
            negotiation_timeout,
            heartbeat_interval,
            ice_servers,
            turn_username,
            turn_credential,
            api_url: non_empty(vars, "CALL_API_URL"),
            api_token: non_empty(vars, "CALL_API_TOKEN"),
            signing_key: non_empty(vars, "CALL_SIGNING_KEY"),
        })
    }
}

fn non_empty(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Liest eine positive Sekundenzahl
fn seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let Some(raw) = non_empty(vars, name) else {
        return Ok(Duration::from_secs(default));
    };
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
    }
}
