//! Call Controller
//!
//! Besitzt die `CallSession` und verarbeitet UI-Befehle, Relay-Events,
//! Timer und Peer-Events nacheinander in einem einzigen Task. Damit ist ein
//! `callAccepted` vollständig verarbeitet, bevor ein Aushandlungs-Event
//! desselben Peers angefasst wird.
//!
//! Aushandlungs-Events (offer/answer/ice-candidate), die vor der Annahme
//! eintreffen, werden pro Session gepuffert und danach in Reihenfolge
//! abgearbeitet.

use super::events::CallEvent;
use super::records::{CallRecorder, RecordError};
use crate::media::{
    MediaDevices, MediaError, MediaNegotiator, NegotiationEngine, NegotiationRole,
    PeerConnectionState, PeerEvent, PeerEventSink, TrackKind,
};
use crate::session::{
    CallSession, CallStatus, EndReason, MediaMode, NegotiationPhase, TransitionError,
};
use crate::signaling::{RelayChannel, RelayEvent, SignalPayload, SignalingError, SignalingEvent};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Klingel-Fenster für ein- und ausgehende Anrufe
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximale Wartezeit auf eine stehende Medienverbindung
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Obergrenze für vor der Annahme gepufferte Aushandlungs-Events
const MAX_PENDING_SIGNALS: usize = 64;

const COMMAND_CHANNEL_BUFFER: usize = 32;

// Reason-Strings auf dem Draht
const REASON_BUSY: &str = "busy";
const REASON_DECLINED: &str = "declined";
const REASON_CANCELLED: &str = "cancelled";
const REASON_TIMEOUT: &str = "timeout";
const REASON_NO_ANSWER: &str = "no-answer";
const REASON_FAILED: &str = "failed";
const REASON_MEDIA_UNAVAILABLE: &str = "media-unavailable";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Failed to create call record: {0}")]
    Record(#[from] RecordError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Invalid peer id: {0:?}")]
    InvalidPeer(String),

    #[error("Cannot call yourself")]
    SelfCall,

    #[error("Call controller stopped")]
    ControllerStopped,
}

// ============================================================================
// SETTINGS & COLLABORATORS
// ============================================================================

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Eigene Benutzer-ID (`from` aller ausgehenden Events)
    pub local_id: String,
    /// Name, der beim Angerufenen angezeigt wird
    pub display_name: Option<String>,
    pub ring_timeout: Duration,
    pub negotiation_timeout: Duration,
}

impl ControllerSettings {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            display_name: None,
            ring_timeout: DEFAULT_RING_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Externe Kollaborateure des Controllers
#[derive(Clone)]
pub struct CallDeps {
    pub relay: Arc<dyn RelayChannel>,
    pub engine: Arc<dyn NegotiationEngine>,
    pub devices: Arc<dyn MediaDevices>,
    pub recorder: Option<Arc<dyn CallRecorder>>,
}

// ============================================================================
// MESSAGES
// ============================================================================

#[derive(Debug)]
enum Command {
    Initiate {
        peer_id: String,
        media_mode: MediaMode,
        respond_to: oneshot::Sender<Result<Uuid, CallError>>,
    },
    Accept {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    Cancel {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    SetTrackEnabled {
        kind: TrackKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), CallError>>,
    },
    InputLevel {
        respond_to: oneshot::Sender<f32>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Ring,
    Negotiation,
    Tick,
}

#[derive(Debug, Clone, Copy)]
struct TimerFired {
    call_id: Uuid,
    kind: TimerKind,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Handle zum CallController
#[derive(Clone)]
pub struct CallHandle {
    sender: mpsc::Sender<Command>,
    snapshot: Arc<RwLock<CallSession>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    /// Startet einen ausgehenden Anruf und gibt die Call-ID zurück
    pub async fn initiate_call(
        &self,
        peer_id: impl Into<String>,
        media_mode: MediaMode,
    ) -> Result<Uuid, CallError> {
        let peer_id = peer_id.into();
        self.request(|respond_to| Command::Initiate {
            peer_id,
            media_mode,
            respond_to,
        })
        .await
    }

    /// Nimmt den eingehenden Anruf an
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|respond_to| Command::Accept { respond_to }).await
    }

    /// Lehnt den eingehenden Anruf ab
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|respond_to| Command::Reject { respond_to }).await
    }

    /// Bricht den ausgehenden Anruf ab
    pub async fn cancel_call(&self) -> Result<(), CallError> {
        self.request(|respond_to| Command::Cancel { respond_to }).await
    }

    /// Legt auf
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|respond_to| Command::End { respond_to }).await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|respond_to| Command::SetTrackEnabled {
            kind: TrackKind::Audio,
            enabled,
            respond_to,
        })
        .await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|respond_to| Command::SetTrackEnabled {
            kind: TrackKind::Video,
            enabled,
            respond_to,
        })
        .await
    }

    /// Mikrofon-Pegel des laufenden Anrufs (0.0 ohne Aufnahme)
    pub async fn input_level(&self) -> Result<f32, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::InputLevel { respond_to: tx })
            .await
            .map_err(|_| CallError::ControllerStopped)?;
        rx.await.map_err(|_| CallError::ControllerStopped)
    }

    /// Aktueller Stand der Session
    pub fn session(&self) -> CallSession {
        self.snapshot.read().clone()
    }

    pub fn status(&self) -> CallStatus {
        self.snapshot.read().status()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Beendet einen laufenden Anruf und stoppt den Controller
    pub async fn shutdown(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Shutdown { respond_to: tx })
            .await
            .map_err(|_| CallError::ControllerStopped)?;
        rx.await.map_err(|_| CallError::ControllerStopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, CallError>>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| CallError::ControllerStopped)?;
        rx.await.map_err(|_| CallError::ControllerStopped)?
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("session", &*self.snapshot.read())
            .finish()
    }
}

// ============================================================================
// ACTIVE CALL
// ============================================================================

/// Ressourcen eines nicht-idle Anrufs
struct ActiveCall {
    call_id: Uuid,
    negotiator: Option<MediaNegotiator>,
    pending: VecDeque<SignalPayload>,
    /// Peer Connection meldet Connected
    media_up: bool,
    ring_timer: Option<JoinHandle<()>>,
    negotiation_timer: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(call_id: Uuid) -> Self {
        Self {
            call_id,
            negotiator: None,
            pending: VecDeque::new(),
            media_up: false,
            ring_timer: None,
            negotiation_timer: None,
            ticker: None,
        }
    }

    fn cancel_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    fn cancel_negotiation_timer(&mut self) {
        if let Some(timer) = self.negotiation_timer.take() {
            timer.abort();
        }
    }

    fn cancel_timers(&mut self) {
        self.cancel_ring_timer();
        self.cancel_negotiation_timer();
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

pub struct CallController {
    settings: ControllerSettings,
    deps: CallDeps,
    session: CallSession,
    active: Option<ActiveCall>,
    snapshot: Arc<RwLock<CallSession>>,
    event_tx: broadcast::Sender<CallEvent>,
    commands: mpsc::Receiver<Command>,
    relay_rx: broadcast::Receiver<RelayEvent>,
    relay_open: bool,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    peer_tx: mpsc::UnboundedSender<(Uuid, PeerEvent)>,
    peer_rx: mpsc::UnboundedReceiver<(Uuid, PeerEvent)>,
}

impl CallController {
    /// Startet den Controller-Task und gibt das Handle zurück
    pub fn spawn(settings: ControllerSettings, deps: CallDeps) -> CallHandle {
        let (sender, commands) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (event_tx, _) = broadcast::channel(100);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(CallSession::idle()));

        // Vor dem Spawn abonnieren, damit kein Relay-Event verloren geht
        let relay_rx = deps.relay.subscribe();

        tracing::info!("Starting call controller for {}", settings.local_id);

        let controller = Self {
            settings,
            deps,
            session: CallSession::idle(),
            active: None,
            snapshot: Arc::clone(&snapshot),
            event_tx: event_tx.clone(),
            commands,
            relay_rx,
            relay_open: true,
            timer_tx,
            timer_rx,
            peer_tx,
            peer_rx,
        };
        tokio::spawn(controller.run());

        CallHandle {
            sender,
            snapshot,
            event_tx,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                relay = self.relay_rx.recv(), if self.relay_open => {
                    match relay {
                        Ok(event) => self.handle_relay_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Call controller lagged behind relay by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::warn!("Relay event channel closed");
                            self.relay_open = false;
                            self.handle_relay_event(RelayEvent::Disconnected).await;
                        }
                    }
                }

                Some(fired) = self.timer_rx.recv() => {
                    self.handle_timer(fired).await;
                }

                Some((call_id, event)) = self.peer_rx.recv() => {
                    self.handle_peer_event(call_id, event).await;
                }

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown { respond_to }) => {
                            self.hang_up().await;
                            self.reply(respond_to, ());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.hang_up().await;
                            break;
                        }
                    }
                }
            }
            self.publish();
        }

        tracing::info!("Call controller for {} stopped", self.settings.local_id);
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn publish(&self) {
        *self.snapshot.write() = self.session.clone();
    }

    fn emit(&self, event: CallEvent) {
        self.publish();
        let _ = self.event_tx.send(event);
    }

    fn reply<T>(&self, respond_to: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = respond_to.send(value);
    }

    fn emit_state(&self) {
        self.emit(CallEvent::StateChanged {
            status: self.session.status(),
            peer_id: self.session.peer_id().map(str::to_string),
        });
    }

    async fn send(&self, to: &str, payload: SignalPayload) -> Result<(), SignalingError> {
        let event = SignalingEvent::new(self.settings.local_id.as_str(), to, payload);
        self.deps.relay.send(event).await
    }

    fn arm_timer(&self, call_id: Uuid, kind: TimerKind, after: Duration) -> JoinHandle<()> {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(TimerFired { call_id, kind });
        })
    }

    /// Gesprächsdauer: erster Tick eine Sekunde nach Connected
    fn start_ticker(&self, call_id: Uuid) -> JoinHandle<()> {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if tx
                    .send(TimerFired {
                        call_id,
                        kind: TimerKind::Tick,
                    })
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    fn active_peer(&self) -> Option<String> {
        self.session.peer_id().map(str::to_string)
    }

    /// Gibt Medien und Timer frei und setzt die Session auf Idle zurück
    async fn teardown(&mut self) -> CallSession {
        if let Some(mut active) = self.active.take() {
            active.cancel_timers();
            if let Some(mut negotiator) = active.negotiator.take() {
                negotiator.close().await;
            }
            if !active.pending.is_empty() {
                tracing::debug!(
                    "Dropping {} queued negotiation events of call {}",
                    active.pending.len(),
                    active.call_id
                );
            }
        }
        self.session.reset()
    }

    /// Beendet die Session: Teardown, optional Peer benachrichtigen, UI-Events
    async fn end_session(
        &mut self,
        reason: EndReason,
        notify: Option<SignalPayload>,
    ) -> Result<(), SignalingError> {
        let previous = self.teardown().await;
        let peer_id = previous.peer_id().unwrap_or_default().to_string();

        if reason.is_failure() {
            tracing::error!("Call with {} failed: {}", peer_id, reason.status_message());
        } else {
            tracing::info!("Call with {} ended: {}", peer_id, reason.status_message());
        }

        let notified = match notify {
            Some(payload) if !peer_id.is_empty() => self.send(&peer_id, payload).await,
            _ => Ok(()),
        };

        self.emit_state();
        match reason {
            EndReason::Failed { message } => self.emit(CallEvent::CallFailed {
                peer_id: Some(peer_id.clone()),
                message,
            }),
            reason => self.emit(CallEvent::CallEnded {
                peer_id: peer_id.clone(),
                reason,
            }),
        }

        if let Err(e) = &notified {
            tracing::error!("Failed to notify {}: {}", peer_id, e);
            self.emit(CallEvent::CallFailed {
                peer_id: Some(peer_id),
                message: format!("Failed to notify peer: {}", e),
            });
        }
        notified
    }

    /// Bricht den aktiven Anruf mit Fehler ab. Bei Relay-Fehlern wird der
    /// Peer nicht mehr benachrichtigt.
    async fn abort_call(&mut self, error: CallError) {
        if self.session.is_idle() {
            return;
        }
        let notify = match (&error, self.session.status()) {
            (CallError::Signaling(_), _) => None,
            (_, CallStatus::Incoming) => Some(SignalPayload::CallReject {
                reason: Some(REASON_FAILED.to_string()),
            }),
            _ => Some(SignalPayload::CallEnd {
                reason: Some(REASON_FAILED.to_string()),
            }),
        };
        let _ = self
            .end_session(
                EndReason::Failed {
                    message: error.to_string(),
                },
                notify,
            )
            .await;
    }

    /// Beendet einen laufenden Anruf passend zum Status (Shutdown)
    async fn hang_up(&mut self) {
        let result = match self.session.status() {
            CallStatus::Idle => return,
            CallStatus::Outgoing => self.cancel_call().await,
            CallStatus::Incoming => self.reject_call().await,
            CallStatus::Connected => self.end_call().await,
        };
        if let Err(e) = result {
            tracing::warn!("Failed to hang up during shutdown: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // User commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate {
                peer_id,
                media_mode,
                respond_to,
            } => {
                let result = self.initiate_call(peer_id, media_mode).await;
                self.reply(respond_to, result);
            }
            Command::Accept { respond_to } => {
                let result = self.accept_call().await;
                self.reply(respond_to, result);
            }
            Command::Reject { respond_to } => {
                let result = self.reject_call().await;
                self.reply(respond_to, result);
            }
            Command::Cancel { respond_to } => {
                let result = self.cancel_call().await;
                self.reply(respond_to, result);
            }
            Command::End { respond_to } => {
                let result = self.end_call().await;
                self.reply(respond_to, result);
            }
            Command::SetTrackEnabled {
                kind,
                enabled,
                respond_to,
            } => {
                let result = self.set_track_enabled(kind, enabled);
                self.reply(respond_to, result);
            }
            Command::InputLevel { respond_to } => {
                let level = self
                    .active
                    .as_ref()
                    .and_then(|a| a.negotiator.as_ref())
                    .map(MediaNegotiator::input_level)
                    .unwrap_or(0.0);
                let _ = respond_to.send(level);
            }
            Command::Shutdown { respond_to } => {
                self.hang_up().await;
                self.reply(respond_to, ());
            }
        }
    }

    async fn initiate_call(
        &mut self,
        peer_id: String,
        media_mode: MediaMode,
    ) -> Result<Uuid, CallError> {
        let peer_id = peer_id.trim().to_string();
        if peer_id.is_empty() {
            return Err(CallError::InvalidPeer(peer_id));
        }
        if peer_id == self.settings.local_id {
            return Err(CallError::SelfCall);
        }
        self.session.ensure(CallStatus::Idle, "initiate_call")?;

        if let Some(recorder) = &self.deps.recorder {
            recorder.record_initiation(&peer_id, media_mode).await?;
        }

        let call_id = self.session.begin_outgoing(peer_id.clone(), media_mode)?;
        let mut active = ActiveCall::new(call_id);
        active.ring_timer = Some(self.arm_timer(call_id, TimerKind::Ring, self.settings.ring_timeout));
        self.active = Some(active);

        tracing::info!("Calling {} ({})", peer_id, media_mode);
        self.emit_state();

        let request = SignalPayload::CallRequest {
            media_mode,
            caller_name: self.settings.display_name.clone(),
        };
        if let Err(e) = self.send(&peer_id, request).await {
            let _ = self
                .end_session(
                    EndReason::Failed {
                        message: format!("Could not reach {}: {}", peer_id, e),
                    },
                    None,
                )
                .await;
            return Err(e.into());
        }

        Ok(call_id)
    }

    async fn accept_call(&mut self) -> Result<(), CallError> {
        self.session.ensure(CallStatus::Incoming, "accept_call")?;
        let (Some(call_id), Some(peer_id)) = (self.session.call_id(), self.active_peer()) else {
            return Err(TransitionError {
                operation: "accept_call",
                status: self.session.status(),
            }
            .into());
        };
        let media_mode = self.session.media_mode();

        if let Some(active) = self.active.as_mut() {
            active.cancel_ring_timer();
        }
        self.session.connect()?;
        tracing::info!("Accepted call from {}", peer_id);
        self.emit_state();

        let negotiator = match MediaNegotiator::start(
            self.deps.devices.as_ref(),
            self.deps.engine.as_ref(),
            peer_id.clone(),
            media_mode,
            NegotiationRole::Answerer,
            PeerEventSink::new(call_id, self.peer_tx.clone()),
        )
        .await
        {
            Ok(negotiator) => negotiator,
            Err(e) => {
                let _ = self
                    .end_session(
                        EndReason::Failed {
                            message: format!("Could not start media: {}", e),
                        },
                        Some(SignalPayload::CallReject {
                            reason: Some(REASON_MEDIA_UNAVAILABLE.to_string()),
                        }),
                    )
                    .await;
                return Err(e.into());
            }
        };
        self.enter_connected(call_id, negotiator);

        if let Err(e) = self.send(&peer_id, SignalPayload::CallAccept).await {
            self.abort_call(CallError::Signaling(e.clone())).await;
            return Err(e.into());
        }

        self.replay_pending().await;
        Ok(())
    }

    async fn reject_call(&mut self) -> Result<(), CallError> {
        self.session.ensure(CallStatus::Incoming, "reject_call")?;
        self.end_session(
            EndReason::Declined,
            Some(SignalPayload::CallReject {
                reason: Some(REASON_DECLINED.to_string()),
            }),
        )
        .await?;
        Ok(())
    }

    async fn cancel_call(&mut self) -> Result<(), CallError> {
        self.session.ensure(CallStatus::Outgoing, "cancel_call")?;
        self.end_session(
            EndReason::Cancelled,
            Some(SignalPayload::CallEnd {
                reason: Some(REASON_CANCELLED.to_string()),
            }),
        )
        .await?;
        Ok(())
    }

    async fn end_call(&mut self) -> Result<(), CallError> {
        self.session.ensure(CallStatus::Connected, "end_call")?;
        self.end_session(EndReason::HungUp, Some(SignalPayload::CallEnd { reason: None }))
            .await?;
        Ok(())
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<(), CallError> {
        let operation = match kind {
            TrackKind::Audio => "set_audio_enabled",
            TrackKind::Video => "set_video_enabled",
        };
        self.session.ensure(CallStatus::Connected, operation)?;

        match kind {
            TrackKind::Audio => self.session.set_audio_enabled(enabled),
            TrackKind::Video => self.session.set_video_enabled(enabled),
        }
        if let Some(negotiator) = self.active.as_mut().and_then(|a| a.negotiator.as_mut()) {
            negotiator.set_track_enabled(kind, enabled);
        }

        tracing::debug!("{:?} track enabled: {}", kind, enabled);
        self.emit(CallEvent::MediaToggled {
            audio_enabled: self.session.audio_enabled(),
            video_enabled: self.session.video_enabled(),
        });
        Ok(())
    }

    /// Gemeinsamer Teil beim Eintritt in Connected: Negotiator übernehmen,
    /// Dauerzähler und Aushandlungs-Timeout starten
    fn enter_connected(&mut self, call_id: Uuid, negotiator: MediaNegotiator) {
        let ticker = self.start_ticker(call_id);
        let negotiation_timer =
            self.arm_timer(call_id, TimerKind::Negotiation, self.settings.negotiation_timeout);

        if let Some(active) = self.active.as_mut() {
            active.negotiator = Some(negotiator);
            active.ticker = Some(ticker);
            active.negotiation_timer = Some(negotiation_timer);
        }
    }

    // ------------------------------------------------------------------------
    // Relay events (Dispatch nach SignalKind)
    // ------------------------------------------------------------------------

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected => {
                tracing::debug!("Relay connected");
            }
            RelayEvent::Disconnected => {
                if !self.session.is_idle() {
                    self.abort_call(CallError::Signaling(SignalingError::NotConnected))
                        .await;
                }
            }
            RelayEvent::Signal(signal) => self.dispatch(signal).await,
        }
    }

    async fn dispatch(&mut self, event: SignalingEvent) {
        if !event.to.is_empty() && event.to != self.settings.local_id {
            tracing::debug!(
                "Ignoring {} addressed to {}",
                event.kind().event_name(),
                event.to
            );
            return;
        }

        let SignalingEvent { from, payload, .. } = event;
        match payload {
            SignalPayload::CallRequest {
                media_mode,
                caller_name,
            } => self.on_call_request(from, media_mode, caller_name).await,
            SignalPayload::CallAccept => self.on_call_accepted(from).await,
            SignalPayload::CallReject { reason } => self.on_call_rejected(from, reason).await,
            SignalPayload::CallEnd { reason } => self.on_call_ended(from, reason).await,
            SignalPayload::CallFailed { message } => self.on_call_failed(from, message).await,
            payload @ (SignalPayload::Offer(_)
            | SignalPayload::Answer(_)
            | SignalPayload::IceCandidate(_)) => self.on_negotiation(from, payload).await,
        }
    }

    async fn on_call_request(
        &mut self,
        from: String,
        media_mode: MediaMode,
        caller_name: Option<String>,
    ) {
        if from.is_empty() || from == self.settings.local_id {
            tracing::warn!("Ignoring call request with invalid sender {:?}", from);
            return;
        }

        if !self.session.is_idle() {
            if self.session.is_peer(&from) && self.session.status() == CallStatus::Incoming {
                tracing::debug!("Ignoring duplicate call request from {}", from);
                return;
            }
            tracing::info!("Busy, rejecting call request from {}", from);
            let busy = SignalPayload::CallReject {
                reason: Some(REASON_BUSY.to_string()),
            };
            if let Err(e) = self.send(&from, busy).await {
                tracing::warn!("Failed to send busy reject to {}: {}", from, e);
            }
            return;
        }

        let call_id = match self
            .session
            .begin_incoming(from.clone(), caller_name.clone(), media_mode)
        {
            Ok(call_id) => call_id,
            Err(e) => {
                tracing::warn!("Ignoring call request from {}: {}", from, e);
                return;
            }
        };
        let mut active = ActiveCall::new(call_id);
        active.ring_timer = Some(self.arm_timer(call_id, TimerKind::Ring, self.settings.ring_timeout));
        self.active = Some(active);

        tracing::info!("Incoming {} call from {}", media_mode, from);
        self.emit_state();
        self.emit(CallEvent::IncomingCall {
            peer_id: from,
            peer_name: caller_name,
            media_mode,
        });
    }

    async fn on_call_accepted(&mut self, from: String) {
        if self.session.status() != CallStatus::Outgoing || !self.session.is_peer(&from) {
            tracing::debug!("Ignoring stale callAccepted from {}", from);
            return;
        }
        let Some(call_id) = self.session.call_id() else {
            return;
        };
        let media_mode = self.session.media_mode();

        if let Some(active) = self.active.as_mut() {
            active.cancel_ring_timer();
        }
        if let Err(e) = self.session.connect() {
            tracing::warn!("Cannot connect call with {}: {}", from, e);
            return;
        }
        tracing::info!("Call accepted by {}", from);
        self.emit_state();

        if let Err(e) = self.start_offer(call_id, from, media_mode).await {
            self.abort_call(e).await;
            return;
        }
        self.replay_pending().await;
    }

    /// Anrufer: Medien aufnehmen, Offer erstellen und senden
    async fn start_offer(
        &mut self,
        call_id: Uuid,
        peer_id: String,
        media_mode: MediaMode,
    ) -> Result<(), CallError> {
        let mut negotiator = MediaNegotiator::start(
            self.deps.devices.as_ref(),
            self.deps.engine.as_ref(),
            peer_id.clone(),
            media_mode,
            NegotiationRole::Offerer,
            PeerEventSink::new(call_id, self.peer_tx.clone()),
        )
        .await?;

        let offer = match negotiator.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                negotiator.close().await;
                return Err(e.into());
            }
        };
        self.enter_connected(call_id, negotiator);

        self.send(&peer_id, SignalPayload::Offer(offer)).await?;
        self.session.set_phase(NegotiationPhase::OfferSent);
        tracing::debug!("Offer sent to {}", peer_id);
        Ok(())
    }

    async fn on_call_rejected(&mut self, from: String, reason: Option<String>) {
        if self.session.status() != CallStatus::Outgoing || !self.session.is_peer(&from) {
            tracing::debug!("Ignoring stale callRejected from {}", from);
            return;
        }
        let reason = match reason.as_deref() {
            Some(REASON_TIMEOUT) => EndReason::NoAnswer,
            _ => EndReason::RejectedByPeer { reason },
        };
        let _ = self.end_session(reason, None).await;
    }

    async fn on_call_ended(&mut self, from: String, reason: Option<String>) {
        if self.session.is_idle() || !self.session.is_peer(&from) {
            tracing::debug!("Ignoring stale callEnded from {}", from);
            return;
        }
        let reason = match (self.session.status(), reason.as_deref()) {
            (CallStatus::Incoming, Some(REASON_NO_ANSWER)) => EndReason::Missed,
            (_, Some(REASON_FAILED)) => EndReason::Failed {
                message: "Call failed on the other side".to_string(),
            },
            _ => EndReason::EndedByPeer,
        };
        let _ = self.end_session(reason, None).await;
    }

    /// `callFailed` ohne Absender kommt vom Relay selbst (z.B. Peer offline)
    async fn on_call_failed(&mut self, from: String, message: String) {
        if self.session.is_idle() || (!from.is_empty() && !self.session.is_peer(&from)) {
            tracing::debug!("Ignoring stale callFailed from {:?}", from);
            return;
        }
        let message = if message.is_empty() {
            "Call failed".to_string()
        } else {
            message
        };
        let _ = self.end_session(EndReason::Failed { message }, None).await;
    }

    async fn on_negotiation(&mut self, from: String, payload: SignalPayload) {
        if self.session.is_idle() || !self.session.is_peer(&from) {
            tracing::debug!(
                "Ignoring stale {} from {}",
                payload.kind().event_name(),
                from
            );
            return;
        }

        if self.session.status() != CallStatus::Connected {
            let Some(active) = self.active.as_mut() else {
                return;
            };
            if active.pending.len() >= MAX_PENDING_SIGNALS {
                tracing::warn!(
                    "Dropping {} from {}: too many queued negotiation events",
                    payload.kind().event_name(),
                    from
                );
                return;
            }
            tracing::debug!(
                "Queueing {} from {} until the call is accepted",
                payload.kind().event_name(),
                from
            );
            active.pending.push_back(payload);
            return;
        }

        if let Err(e) = self.apply_negotiation(payload).await {
            self.abort_call(e).await;
        }
    }

    async fn replay_pending(&mut self) {
        let pending = match self.active.as_mut() {
            Some(active) => std::mem::take(&mut active.pending),
            None => return,
        };
        if !pending.is_empty() {
            tracing::debug!("Replaying {} queued negotiation events", pending.len());
        }

        for payload in pending {
            if self.session.status() != CallStatus::Connected {
                break;
            }
            if let Err(e) = self.apply_negotiation(payload).await {
                self.abort_call(e).await;
                break;
            }
        }
    }

    async fn apply_negotiation(&mut self, payload: SignalPayload) -> Result<(), CallError> {
        let Some(peer_id) = self.active_peer() else {
            return Ok(());
        };
        let negotiator = self
            .active
            .as_mut()
            .and_then(|a| a.negotiator.as_mut())
            .ok_or(MediaError::Closed)?;

        match payload {
            SignalPayload::Offer(offer) => {
                let answer = match negotiator.accept_offer(offer).await {
                    Ok(answer) => answer,
                    Err(MediaError::OutOfOrder(what)) => {
                        tracing::warn!("Ignoring unexpected {} from {}", what, peer_id);
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                self.send(&peer_id, SignalPayload::Answer(answer)).await?;
                self.session.set_phase(NegotiationPhase::AnswerSent);
                tracing::debug!("Answer sent to {}", peer_id);
            }
            SignalPayload::Answer(answer) => match negotiator.accept_answer(answer).await {
                Ok(()) => tracing::debug!("Remote answer from {} applied", peer_id),
                Err(MediaError::OutOfOrder(what)) => {
                    tracing::warn!("Ignoring unexpected {} from {}", what, peer_id);
                }
                Err(e) => return Err(e.into()),
            },
            SignalPayload::IceCandidate(candidate) => {
                if let Err(e) = negotiator.add_remote_candidate(candidate).await {
                    tracing::warn!("Failed to add ICE candidate from {}: {}", peer_id, e);
                }
            }
            other => {
                tracing::debug!("Not a negotiation event: {}", other.kind().event_name());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    async fn handle_timer(&mut self, fired: TimerFired) {
        if self.session.call_id() != Some(fired.call_id) {
            return;
        }

        match fired.kind {
            TimerKind::Ring => match self.session.status() {
                CallStatus::Outgoing => {
                    let _ = self
                        .end_session(
                            EndReason::NoAnswer,
                            Some(SignalPayload::CallEnd {
                                reason: Some(REASON_NO_ANSWER.to_string()),
                            }),
                        )
                        .await;
                }
                CallStatus::Incoming => {
                    let _ = self
                        .end_session(
                            EndReason::Missed,
                            Some(SignalPayload::CallReject {
                                reason: Some(REASON_TIMEOUT.to_string()),
                            }),
                        )
                        .await;
                }
                _ => {}
            },
            TimerKind::Negotiation => {
                let media_up = self.active.as_ref().is_some_and(|a| a.media_up);
                if self.session.status() == CallStatus::Connected && !media_up {
                    self.abort_call(CallError::Media(MediaError::Negotiation(
                        "media connection was not established in time".to_string(),
                    )))
                    .await;
                }
            }
            TimerKind::Tick => {
                if let Some(seconds) = self.session.tick() {
                    self.emit(CallEvent::DurationTick { seconds });
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------------

    async fn handle_peer_event(&mut self, call_id: Uuid, event: PeerEvent) {
        if self.session.call_id() != Some(call_id)
            || self.session.status() != CallStatus::Connected
        {
            tracing::trace!("Ignoring peer event of closed call {}", call_id);
            return;
        }
        let Some(peer_id) = self.active_peer() else {
            return;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .send(&peer_id, SignalPayload::IceCandidate(candidate))
                    .await
                {
                    self.abort_call(e.into()).await;
                }
            }
            PeerEvent::StateChanged(PeerConnectionState::Connected) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if active.media_up {
                    return;
                }
                active.media_up = true;
                active.cancel_negotiation_timer();
                self.session.set_phase(NegotiationPhase::Established);
                tracing::info!("Media connected with {}", peer_id);
                self.emit(CallEvent::MediaConnected { peer_id });
            }
            PeerEvent::StateChanged(PeerConnectionState::Disconnected) => {
                // Begrenzte Wartezeit auf Wiederverbindung
                tracing::warn!("Media connection with {} interrupted", peer_id);
                let timeout = self.settings.negotiation_timeout;
                let timer = self.arm_timer(call_id, TimerKind::Negotiation, timeout);
                if let Some(active) = self.active.as_mut() {
                    active.media_up = false;
                    active.cancel_negotiation_timer();
                    active.negotiation_timer = Some(timer);
                }
            }
            PeerEvent::StateChanged(PeerConnectionState::Failed) => {
                self.abort_call(CallError::Media(MediaError::Negotiation(
                    "media connection failed".to_string(),
                )))
                .await;
            }
            PeerEvent::StateChanged(PeerConnectionState::Closed) => {
                self.abort_call(CallError::Media(MediaError::Closed)).await;
            }
            PeerEvent::StateChanged(state) => {
                tracing::debug!("Peer connection with {}: {:?}", peer_id, state);
            }
            PeerEvent::RemoteTrack(track) => {
                tracing::info!("Remote {:?} track from {}", track.kind, peer_id);
                self.emit(CallEvent::RemoteStream { peer_id, track });
            }
        }
    }
}
