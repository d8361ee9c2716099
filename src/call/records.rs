//! REST Client für Anruf-Einträge
//!
//! Vor dem Klingeln wird beim Backend ein Anruf-Eintrag angelegt
//! (`POST {api}/calls/initiate`). Schlägt das fehl, wird der Anruf nicht
//! gestartet.

use crate::session::MediaMode;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Timeout für einen einzelnen Request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Invalid API base URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Call record rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Legt Anruf-Einträge beim Backend an
#[async_trait]
pub trait CallRecorder: Send + Sync {
    async fn record_initiation(
        &self,
        target_user_id: &str,
        media_mode: MediaMode,
    ) -> Result<(), RecordError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiateCallRequest<'a> {
    target_user_id: &'a str,
    call_type: MediaMode,
}

/// CallRecorder über HTTP (reqwest)
pub struct HttpCallRecorder {
    client: reqwest::Client,
    endpoint: url::Url,
    token: Option<String>,
}

impl HttpCallRecorder {
    pub fn new(api_base: &str, token: Option<String>) -> Result<Self, RecordError> {
        // Ohne abschließenden Slash würde `join` das letzte Segment ersetzen
        let base = if api_base.ends_with('/') {
            api_base.to_string()
        } else {
            format!("{}/", api_base)
        };
        let endpoint = url::Url::parse(&base)
            .and_then(|u| u.join("calls/initiate"))
            .map_err(|e| RecordError::InvalidUrl(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }
}

#[async_trait]
impl CallRecorder for HttpCallRecorder {
    async fn record_initiation(
        &self,
        target_user_id: &str,
        media_mode: MediaMode,
    ) -> Result<(), RecordError> {
        let mut req = self.client.post(self.endpoint.clone()).json(&InitiateCallRequest {
            target_user_id,
            call_type: media_mode,
        });
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Call record for {} rejected: {}", target_user_id, status);
            return Err(RecordError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!("Call record created for {} ({})", target_user_id, media_mode);
        Ok(())
    }
}

impl std::fmt::Debug for HttpCallRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCallRecorder")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
