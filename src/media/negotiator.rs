//! Media Negotiation Adapter
//!
//! Besitzt die lokale Aufnahme und die PeerSession eines Anrufs.
//! Remote ICE Candidates, die vor der Remote Description ankommen, werden
//! gepuffert und danach genau einmal in Ankunftsreihenfolge angewendet.
//! Die Aufnahme wird bei `close` und spätestens beim Drop freigegeben.

use super::{
    LocalMedia, MediaDevices, MediaError, NegotiationEngine, PeerEventSink, PeerSession,
    TrackKind,
};
use crate::session::MediaMode;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use std::collections::VecDeque;

/// Rolle in der Offer/Answer-Aushandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Anrufer: erstellt das Offer nachdem der Peer angenommen hat
    Offerer,
    /// Angerufener: beantwortet das Offer
    Answerer,
}

/// Was mit einem Remote Candidate passiert ist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
}

pub struct MediaNegotiator {
    peer_id: String,
    role: NegotiationRole,
    capture: Option<Box<dyn LocalMedia>>,
    session: Option<Box<dyn PeerSession>>,
    local_description_set: bool,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
}

impl MediaNegotiator {
    /// Nimmt die lokale Aufnahme auf und öffnet die PeerSession.
    /// Schlägt das Öffnen fehl, wird die Aufnahme sofort wieder freigegeben.
    pub async fn start(
        devices: &dyn MediaDevices,
        engine: &dyn NegotiationEngine,
        peer_id: String,
        mode: MediaMode,
        role: NegotiationRole,
        events: PeerEventSink,
    ) -> Result<Self, MediaError> {
        let mut capture = devices.acquire(mode)?;
        let tracks = capture.tracks();

        tracing::info!(
            "Local capture acquired for {} ({:?}, {:?})",
            peer_id,
            tracks,
            role
        );

        match engine.open(&tracks, events).await {
            Ok(session) => Ok(Self {
                peer_id,
                role,
                capture: Some(capture),
                session: Some(session),
                local_description_set: false,
                remote_description_set: false,
                pending_candidates: VecDeque::new(),
            }),
            Err(e) => {
                capture.stop();
                Err(e)
            }
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    fn session(&self) -> Result<&dyn PeerSession, MediaError> {
        self.session.as_deref().ok_or(MediaError::Closed)
    }

    /// Erstellt das Offer (nur Anrufer, nur einmal)
    pub async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        if self.role != NegotiationRole::Offerer || self.local_description_set {
            return Err(MediaError::OutOfOrder("offer creation"));
        }
        let offer = self.session()?.create_offer().await?;
        self.local_description_set = true;
        Ok(offer)
    }

    /// Setzt das Offer des Anrufers, wendet gepufferte Candidates an und
    /// erstellt das Answer
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        if self.role != NegotiationRole::Answerer
            || offer.sdp_type != SdpType::Offer
            || self.remote_description_set
        {
            return Err(MediaError::OutOfOrder("offer"));
        }

        self.session()?.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = self.session()?.create_answer().await?;
        self.local_description_set = true;
        Ok(answer)
    }

    /// Setzt das Answer des Angerufenen und wendet gepufferte Candidates an
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), MediaError> {
        if self.role != NegotiationRole::Offerer
            || answer.sdp_type != SdpType::Answer
            || !self.local_description_set
            || self.remote_description_set
        {
            return Err(MediaError::OutOfOrder("answer"));
        }

        self.session()?.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(())
    }

    /// Wendet einen Remote Candidate an oder puffert ihn bis die Remote
    /// Description gesetzt ist
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, MediaError> {
        if !self.remote_description_set {
            tracing::debug!(
                "Buffering ICE candidate from {} ({} pending)",
                self.peer_id,
                self.pending_candidates.len() + 1
            );
            self.pending_candidates.push_back(candidate);
            return Ok(CandidateDisposition::Buffered);
        }

        self.session()?.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    async fn flush_candidates(&mut self) {
        let Some(session) = self.session.as_deref() else {
            return;
        };

        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = session.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply buffered ICE candidate: {}", e);
            }
        }
    }

    pub fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) {
        if let Some(capture) = self.capture.as_mut() {
            capture.set_track_enabled(kind, enabled);
        }
    }

    /// Eingangspegel der lokalen Aufnahme
    pub fn input_level(&self) -> f32 {
        self.capture.as_ref().map(|c| c.input_level()).unwrap_or(0.0)
    }

    /// Stoppt die Aufnahme und schließt die PeerSession
    pub async fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.pending_candidates.clear();
        if let Some(session) = self.session.take() {
            session.close().await;
            tracing::info!("Negotiation session with {} closed", self.peer_id);
        }
    }
}

impl Drop for MediaNegotiator {
    fn drop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(session) = self.session.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    session.close().await;
                });
            }
        }
    }
}

impl std::fmt::Debug for MediaNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaNegotiator")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("capture", &self.capture.is_some())
            .field("remote_description_set", &self.remote_description_set)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
