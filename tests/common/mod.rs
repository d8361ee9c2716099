//! In-Memory Fakes für Relay, Negotiation Engine und Aufnahmegeräte

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use ringwire::media::{
    LocalMedia, MediaDevices, MediaError, NegotiationEngine, PeerConnectionState, PeerEvent,
    PeerEventSink, PeerSession, RemoteTrack, TrackKind,
};
use ringwire::signaling::{
    IceCandidate, RelayChannel, RelayEvent, SessionDescription, SignalKind, SignalPayload,
    SignalingError, SignalingEvent,
};
use ringwire::{
    CallController, CallDeps, CallEvent, CallHandle, CallRecorder, ControllerSettings, MediaMode,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// RELAY
// ============================================================================

/// Verteilt Events zwischen MemoryRelays anhand von `to`
#[derive(Default)]
pub struct RelayHub {
    peers: Mutex<HashMap<String, broadcast::Sender<RelayEvent>>>,
}

impl RelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>, id: &str) -> Arc<MemoryRelay> {
        let relay = MemoryRelay::new(id, Some(Arc::clone(self)));
        self.peers
            .lock()
            .insert(id.to_string(), relay.event_tx.clone());
        relay
    }

    fn route(&self, event: SignalingEvent) -> bool {
        let peers = self.peers.lock();
        match peers.get(&event.to) {
            Some(tx) => {
                let _ = tx.send(RelayEvent::Signal(event));
                true
            }
            None => false,
        }
    }
}

pub struct MemoryRelay {
    id: String,
    hub: Option<Arc<RelayHub>>,
    event_tx: broadcast::Sender<RelayEvent>,
    sent: Mutex<Vec<SignalingEvent>>,
    fail_sends: AtomicBool,
    connected: AtomicBool,
}

impl MemoryRelay {
    fn new(id: &str, hub: Option<Arc<RelayHub>>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            id: id.to_string(),
            hub,
            event_tx,
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        })
    }

    /// Relay ohne Gegenstelle; eingehende Events kommen über `inject`
    pub fn standalone(id: &str) -> Arc<Self> {
        Self::new(id, None)
    }

    /// Liefert ein Event aus, als käme es vom Relay-Server
    pub fn inject(&self, from: &str, payload: SignalPayload) {
        let _ = self.event_tx.send(RelayEvent::Signal(SignalingEvent::new(
            from,
            self.id.as_str(),
            payload,
        )));
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(RelayEvent::Disconnected);
    }

    pub fn sent(&self) -> Vec<SignalingEvent> {
        self.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<SignalKind> {
        self.sent.lock().iter().map(SignalingEvent::kind).collect()
    }

    pub fn sent_of(&self, kind: SignalKind) -> Vec<SignalingEvent> {
        self.sent
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RelayChannel for MemoryRelay {
    async fn send(&self, event: SignalingEvent) -> Result<(), SignalingError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SignalingError::SendFailed("relay unreachable".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(event.clone());

        if let Some(hub) = &self.hub {
            let kind = event.kind();
            if !hub.route(event) && kind == SignalKind::CallRequest {
                // Der Relay meldet nicht erreichbare Empfänger selbst
                let _ = self.event_tx.send(RelayEvent::Signal(SignalingEvent::new(
                    "",
                    self.id.as_str(),
                    SignalPayload::CallFailed {
                        message: "User is offline".to_string(),
                    },
                )));
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ============================================================================
// NEGOTIATION ENGINE
// ============================================================================

/// Fake Engine: eine Session meldet Connected, sobald Local und Remote
/// Description gesetzt sind
#[derive(Default)]
pub struct LoopbackEngine {
    state: Arc<EngineState>,
}

#[derive(Default)]
pub struct EngineState {
    pub fail_open: AtomicBool,
    pub hold_connection: AtomicBool,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub applied_candidates: Mutex<Vec<String>>,
    pub sinks: Mutex<Vec<PeerEventSink>>,
}

impl LoopbackEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.applied_candidates.lock().clone()
    }

    /// Schickt ein PeerEvent an die zuletzt geöffnete Session
    pub fn emit_to_last(&self, event: PeerEvent) {
        if let Some(sink) = self.state.sinks.lock().last() {
            sink.emit(event);
        }
    }
}

#[async_trait]
impl NegotiationEngine for LoopbackEngine {
    async fn open(
        &self,
        tracks: &[TrackKind],
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerSession>, MediaError> {
        if self.state.fail_open.load(Ordering::SeqCst) {
            return Err(MediaError::Negotiation("no compatible codecs".to_string()));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        self.state.sinks.lock().push(events.clone());

        Ok(Box::new(LoopbackSession {
            state: Arc::clone(&self.state),
            sink: events,
            tracks: tracks.to_vec(),
            local: AtomicBool::new(false),
            remote: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        }))
    }
}

struct LoopbackSession {
    state: Arc<EngineState>,
    sink: PeerEventSink,
    tracks: Vec<TrackKind>,
    local: AtomicBool,
    remote: AtomicBool,
    connected: AtomicBool,
}

impl LoopbackSession {
    fn sdp(&self, role: &str) -> String {
        let mut sdp = format!("v=0 {}", role);
        for track in &self.tracks {
            match track {
                TrackKind::Audio => sdp.push_str(" m=audio"),
                TrackKind::Video => sdp.push_str(" m=video"),
            }
        }
        sdp
    }

    fn maybe_connect(&self) {
        if self.state.hold_connection.load(Ordering::SeqCst) {
            return;
        }
        if self.local.load(Ordering::SeqCst)
            && self.remote.load(Ordering::SeqCst)
            && !self.connected.swap(true, Ordering::SeqCst)
        {
            self.sink
                .emit(PeerEvent::StateChanged(PeerConnectionState::Connecting));
            self.sink
                .emit(PeerEvent::StateChanged(PeerConnectionState::Connected));
            for track in &self.tracks {
                self.sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
                    kind: *track,
                    stream_id: "remote".to_string(),
                    track_id: format!("{:?}", track).to_lowercase(),
                    codec: match track {
                        TrackKind::Audio => "audio/opus".to_string(),
                        TrackKind::Video => "video/VP8".to_string(),
                    },
                }));
            }
        }
    }
}

#[async_trait]
impl PeerSession for LoopbackSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.local.store(true, Ordering::SeqCst);
        self.sink
            .emit(PeerEvent::LocalCandidate(IceCandidate::new("candidate:offerer")));
        self.maybe_connect();
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        if !self.remote.load(Ordering::SeqCst) {
            return Err(MediaError::Negotiation("no remote offer".to_string()));
        }
        self.local.store(true, Ordering::SeqCst);
        self.sink
            .emit(PeerEvent::LocalCandidate(IceCandidate::new("candidate:answerer")));
        self.maybe_connect();
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), MediaError> {
        self.remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        if !self.remote.load(Ordering::SeqCst) {
            return Err(MediaError::Negotiation(
                "candidate before remote description".to_string(),
            ));
        }
        self.state
            .applied_candidates
            .lock()
            .push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// DEVICES
// ============================================================================

/// Ein einziges Aufnahmegerät; eine zweite Aufnahme schlägt fehl solange die
/// erste nicht freigegeben ist
#[derive(Default)]
pub struct FakeDevices {
    active: Arc<AtomicUsize>,
    acquired: AtomicUsize,
    fail: AtomicBool,
    level: Arc<Mutex<f32>>,
    toggles: Arc<Mutex<Vec<(TrackKind, bool)>>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_level(&self, level: f32) {
        *self.level.lock() = level;
    }

    pub fn toggles(&self) -> Vec<(TrackKind, bool)> {
        self.toggles.lock().clone()
    }
}

impl MediaDevices for FakeDevices {
    fn acquire(&self, mode: MediaMode) -> Result<Box<dyn LocalMedia>, MediaError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        if self.active.load(Ordering::SeqCst) > 0 {
            return Err(MediaError::DeviceUnavailable("device busy".to_string()));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeCapture {
            tracks: TrackKind::for_mode(mode),
            active: Arc::clone(&self.active),
            level: Arc::clone(&self.level),
            toggles: Arc::clone(&self.toggles),
            stopped: false,
        }))
    }
}

struct FakeCapture {
    tracks: Vec<TrackKind>,
    active: Arc<AtomicUsize>,
    level: Arc<Mutex<f32>>,
    toggles: Arc<Mutex<Vec<(TrackKind, bool)>>>,
    stopped: bool,
}

impl LocalMedia for FakeCapture {
    fn tracks(&self) -> Vec<TrackKind> {
        self.tracks.clone()
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) {
        self.toggles.lock().push((kind, enabled));
    }

    fn input_level(&self) -> f32 {
        if self.stopped {
            0.0
        } else {
            *self.level.lock()
        }
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// HELPERS
// ============================================================================

pub fn spawn_controller(
    local_id: &str,
    relay: Arc<MemoryRelay>,
    engine: Arc<LoopbackEngine>,
    devices: Arc<FakeDevices>,
    recorder: Option<Arc<dyn CallRecorder>>,
) -> CallHandle {
    let mut name = local_id.to_string();
    if let Some(first) = name.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    let settings = ControllerSettings::new(local_id).with_display_name(name);
    CallController::spawn(
        settings,
        CallDeps {
            relay,
            engine,
            devices,
            recorder,
        },
    )
}

/// Wartet auf das erste Event, das `pred` erfüllt
pub async fn expect_event(
    rx: &mut broadcast::Receiver<CallEvent>,
    pred: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), wait)
        .await
        .expect("timed out waiting for call event")
}

/// Lässt alle bereiten Tasks laufen
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
