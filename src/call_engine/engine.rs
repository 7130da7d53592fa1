//! WebRTC Call Engine
//!
//! Verwaltet genau eine Peer Session zur Zeit: Offer/Answer, lokale Medien,
//! gepufferte ICE Candidates sowie Mute/Kamera-Steuerung.
//!
//! Zustandsautomat:
//! `Idle → Calling | Ringing → Connected → Ended | Failed → Idle`

use super::ice::{Admission, IceCandidateQueue};
use super::media::{LocalMedia, MediaDeviceInfo, MediaDevices, MediaError, MediaKind, MediaTrack};
use super::peer::{
    IceCandidate, NegotiationError, PeerConnectionState, PeerEvent, PeerFactory, PeerSession,
    SessionDescription,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Operation not allowed while call is {0:?}")]
    InvalidState(CallState),

    #[error("Call has no local video track")]
    NoVideoTrack,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("Call ended while the operation was in flight")]
    Cancelled,
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf, Offer ist unterwegs
    Calling,
    /// Eingehender Anruf wartet auf Antwort
    Ringing,
    /// Peer-Verbindung steht
    Connected,
    /// Anruf regulär beendet, Aufräumen läuft
    Ended,
    /// Aushandlung oder Verbindung fehlgeschlagen, Aufräumen läuft
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteParty {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl RemoteParty {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Anzeigename, sonst die User-ID
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: String,
    pub remote: RemoteParty,
    pub direction: CallDirection,
    pub kind: MediaKind,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

impl CallSession {
    fn new(call_id: String, remote: RemoteParty, direction: CallDirection, kind: MediaKind) -> Self {
        Self {
            call_id,
            remote,
            direction,
            kind,
            started_at: Utc::now(),
            answered_at: None,
        }
    }
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    /// Lokaler Candidate, muss per Signaling zum Remote-Peer
    LocalCandidate(IceCandidate),
    RemoteTrack { kind: MediaKind, track_id: String },
    Failed {
        session: Option<CallSession>,
        error: CallError,
    },
}

// ============================================================================
// SHARED CORE
// ============================================================================

struct Inner {
    state: CallState,
    session: Option<CallSession>,
    peer: Option<Arc<dyn PeerSession>>,
    local_media: Option<LocalMedia>,
    candidates: IceCandidateQueue,
    answering: bool,
    muted: bool,
    camera_off: bool,
    /// Wird bei jedem Session-Start und -Ende erhöht
    epoch: u64,
}

struct Core {
    inner: Mutex<Inner>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl Core {
    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.lock().epoch == epoch
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), CallError> {
        if self.is_current(epoch) {
            Ok(())
        } else {
            Err(CallError::Cancelled)
        }
    }

    fn mark_connected(&self, epoch: u64) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch || !matches!(inner.state, CallState::Calling | CallState::Ringing) {
                false
            } else {
                inner.state = CallState::Connected;
                if let Some(session) = inner.session.as_mut() {
                    session.answered_at.get_or_insert_with(Utc::now);
                }
                true
            }
        };

        if changed {
            tracing::info!("Call connected");
            self.emit(CallEvent::StateChanged(CallState::Connected));
        }
    }

    /// `* → Failed → Idle`, sofern die Session noch aktuell ist
    async fn fail(&self, epoch: u64, error: CallError) {
        let taken = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch
                || matches!(inner.state, CallState::Idle | CallState::Ended | CallState::Failed)
            {
                None
            } else {
                inner.epoch += 1;
                inner.state = CallState::Failed;
                inner.candidates.reset();
                Some((inner.session.take(), inner.peer.take(), inner.local_media.take()))
            }
        };

        let Some((session, peer, media)) = taken else {
            return;
        };

        tracing::error!("Call failed: {}", error);
        self.emit(CallEvent::StateChanged(CallState::Failed));
        self.emit(CallEvent::Failed { session, error });

        release(peer, media).await;
        self.settle_idle();
    }

    fn settle_idle(&self) {
        let changed = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, CallState::Ended | CallState::Failed) {
                inner.state = CallState::Idle;
                inner.answering = false;
                inner.muted = false;
                inner.camera_off = false;
                true
            } else {
                false
            }
        };

        if changed {
            self.emit(CallEvent::StateChanged(CallState::Idle));
        }
    }
}

async fn release(peer: Option<Arc<dyn PeerSession>>, media: Option<LocalMedia>) {
    if let Some(media) = media {
        media.stop_all();
    }
    if let Some(peer) = peer {
        peer.close().await;
    }
}

async fn apply_candidate(peer: &Arc<dyn PeerSession>, candidate: IceCandidate) {
    if let Err(e) = peer.add_ice_candidate(candidate).await {
        tracing::warn!("Skipping ICE candidate: {}", e);
    }
}

/// Leitet Peer-Events einer Session an den Core weiter
fn spawn_peer_pump(weak: Weak<Core>, epoch: u64, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(core) = weak.upgrade() else {
                break;
            };
            if !core.is_current(epoch) {
                break;
            }

            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    core.emit(CallEvent::LocalCandidate(candidate));
                }
                PeerEvent::RemoteTrack { kind, track_id } => {
                    tracing::info!("Remote {} track {}", kind, track_id);
                    core.emit(CallEvent::RemoteTrack { kind, track_id });
                }
                PeerEvent::StateChanged(PeerConnectionState::Connected) => core.mark_connected(epoch),
                PeerEvent::StateChanged(PeerConnectionState::Failed) => {
                    core.fail(
                        epoch,
                        NegotiationError::WebRtc("peer connectivity failed".to_string()).into(),
                    )
                    .await;
                }
                PeerEvent::StateChanged(other) => {
                    tracing::debug!("Peer connection state: {:?}", other);
                }
            }
        }
    });
}

/// Nächste Kamera nach `current` (zyklisch)
fn next_camera(cameras: &[MediaDeviceInfo], current: Option<&str>) -> Option<String> {
    let cameras: Vec<&MediaDeviceInfo> = cameras.iter().filter(|c| c.kind == MediaKind::Video).collect();
    if cameras.is_empty() {
        return None;
    }
    let index = current
        .and_then(|id| cameras.iter().position(|c| c.device_id == id))
        .map(|i| (i + 1) % cameras.len())
        .unwrap_or(0);
    Some(cameras[index].device_id.clone())
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// WebRTC Call Engine
pub struct CallEngine {
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerFactory>,
    core: Arc<Core>,
}

impl CallEngine {
    pub fn new(devices: Arc<dyn MediaDevices>, peers: Arc<dyn PeerFactory>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            devices,
            peers,
            core: Arc::new(Core {
                inner: Mutex::new(Inner {
                    state: CallState::Idle,
                    session: None,
                    peer: None,
                    local_media: None,
                    candidates: IceCandidateQueue::new(),
                    answering: false,
                    muted: false,
                    camera_off: false,
                    epoch: 0,
                }),
                event_tx,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.core.event_tx.subscribe()
    }

    pub fn state(&self) -> CallState {
        self.core.inner.lock().state
    }

    pub fn session(&self) -> Option<CallSession> {
        self.core.inner.lock().session.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.core.inner.lock().muted
    }

    pub fn is_camera_off(&self) -> bool {
        self.core.inner.lock().camera_off
    }

    pub fn local_media(&self) -> Option<LocalMedia> {
        self.core.inner.lock().local_media.clone()
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Gibt das SDP Offer zurück, das an den Peer gesendet werden muss.
    pub async fn start_call(
        &self,
        remote: RemoteParty,
        kind: MediaKind,
        existing_media: Option<LocalMedia>,
    ) -> Result<SessionDescription, CallError> {
        tracing::info!("Starting {} call to {}", kind, remote.user_id);

        let session = CallSession::new(Uuid::new_v4().to_string(), remote, CallDirection::Outgoing, kind);
        let epoch = self.begin_session(CallState::Calling, session)?;

        match self.negotiate_offer(epoch, kind, existing_media).await {
            Ok(offer) => Ok(offer),
            Err(e) => Err(self.abort(epoch, e).await),
        }
    }

    /// Registriert einen eingehenden Anruf (`Idle → Ringing`), ohne Medien anzufassen
    pub fn register_incoming(
        &self,
        call_id: impl Into<String>,
        remote: RemoteParty,
        kind: MediaKind,
    ) -> Result<CallSession, CallError> {
        let session = CallSession::new(call_id.into(), remote, CallDirection::Incoming, kind);
        tracing::info!("Incoming {} call from {}", kind, session.remote.label());
        self.begin_session(CallState::Ringing, session.clone())?;
        Ok(session)
    }

    /// Nimmt den klingelnden Anruf an
    ///
    /// Gibt das SDP Answer zurück, das an den Anrufer gesendet werden muss.
    pub async fn answer_call(
        &self,
        offer: SessionDescription,
        existing_media: Option<LocalMedia>,
    ) -> Result<SessionDescription, CallError> {
        let (epoch, kind) = {
            let mut inner = self.core.inner.lock();
            if inner.state != CallState::Ringing || inner.answering {
                return Err(CallError::InvalidState(inner.state));
            }
            let kind = match inner.session.as_ref() {
                Some(session) => session.kind,
                None => return Err(CallError::NoActiveCall),
            };
            inner.answering = true;
            (inner.epoch, kind)
        };

        match self.negotiate_answer(epoch, kind, offer, existing_media).await {
            Ok(answer) => Ok(answer),
            Err(e) => Err(self.abort(epoch, e).await),
        }
    }

    /// Verarbeitet das SDP Answer vom Angerufenen
    pub async fn handle_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        let (epoch, peer) = {
            let inner = self.core.inner.lock();
            match inner.state {
                CallState::Calling => {}
                CallState::Idle => return Err(CallError::NoActiveCall),
                other => return Err(CallError::InvalidState(other)),
            }
            if inner.session.as_ref().and_then(|s| s.answered_at).is_some() {
                return Err(CallError::InvalidState(inner.state));
            }
            match inner.peer.clone() {
                Some(peer) => (inner.epoch, peer),
                None => return Err(CallError::InvalidState(inner.state)),
            }
        };

        let result: Result<(), CallError> = async {
            peer.set_remote_description(answer).await?;
            self.drain_candidates(epoch, &peer).await?;
            self.mark_answered(epoch)
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abort(epoch, e).await),
        }
    }

    /// Fügt einen Remote-Candidate hinzu
    ///
    /// Ohne Remote Description wird gepuffert. Fehler einzelner Candidates
    /// werden nur geloggt.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        let apply = {
            let mut inner = self.core.inner.lock();
            if !matches!(
                inner.state,
                CallState::Calling | CallState::Ringing | CallState::Connected
            ) {
                tracing::debug!("Dropping ICE candidate, no active call");
                return;
            }
            match inner.candidates.admit(candidate) {
                Admission::Queued => {
                    tracing::debug!("Queued ICE candidate ({} pending)", inner.candidates.len());
                    None
                }
                Admission::Apply(candidate) => inner.peer.clone().map(|peer| (peer, candidate)),
            }
        };

        if let Some((peer, candidate)) = apply {
            apply_candidate(&peer, candidate).await;
        }
    }

    /// Schaltet das Mikrofon um; gibt den neuen Mute-Status zurück
    pub fn toggle_microphone(&self) -> Result<bool, CallError> {
        let mut inner = self.core.inner.lock();
        let Some(media) = inner.local_media.as_ref() else {
            return Err(CallError::NoActiveCall);
        };

        let muted = !inner.muted;
        for track in media.audio_tracks() {
            track.set_enabled(!muted);
        }
        inner.muted = muted;

        tracing::debug!("Microphone muted: {}", muted);
        Ok(muted)
    }

    /// Schaltet die Kamera um; gibt zurück, ob sie nun aus ist
    pub fn toggle_camera(&self) -> Result<bool, CallError> {
        let mut inner = self.core.inner.lock();
        let Some(media) = inner.local_media.as_ref() else {
            return Err(CallError::NoActiveCall);
        };
        let Some(track) = media.video_track() else {
            return Err(CallError::NoVideoTrack);
        };

        let camera_off = !inner.camera_off;
        track.set_enabled(!camera_off);
        inner.camera_off = camera_off;

        tracing::debug!("Camera off: {}", camera_off);
        Ok(camera_off)
    }

    /// Wechselt die Kamera ohne Renegotiation
    ///
    /// Ohne `device_id` wird zur nächsten Kamera gewechselt. Gibt die ID der
    /// neuen Kamera zurück.
    pub async fn switch_camera(&self, device_id: Option<&str>) -> Result<String, CallError> {
        let (epoch, current, peer, camera_off) = {
            let inner = self.core.inner.lock();
            let media = inner.local_media.as_ref().ok_or(CallError::NoActiveCall)?;
            let current = media.video_track().ok_or(CallError::NoVideoTrack)?;
            (
                inner.epoch,
                current.device_id().map(str::to_string),
                inner.peer.clone(),
                inner.camera_off,
            )
        };

        let target = match device_id {
            Some(id) => id.to_string(),
            None => {
                let cameras = self.devices.cameras().await?;
                next_camera(&cameras, current.as_deref()).ok_or_else(|| {
                    CallError::Media(MediaError::NotFound("no camera to switch to".to_string()))
                })?
            }
        };

        let track = self.devices.open_camera(&target).await?;
        track.set_enabled(!camera_off);

        if let Some(peer) = &peer {
            if let Err(e) = peer.replace_video_track(Arc::clone(&track)).await {
                track.stop();
                return Err(e.into());
            }
        }

        let swapped = {
            let mut inner = self.core.inner.lock();
            if inner.epoch != epoch {
                None
            } else {
                Some(
                    inner
                        .local_media
                        .as_mut()
                        .and_then(|media| media.replace_video(Arc::clone(&track))),
                )
            }
        };

        match swapped {
            None => {
                track.stop();
                Err(CallError::Cancelled)
            }
            Some(previous) => {
                if let Some(previous) = previous {
                    previous.stop();
                }
                tracing::info!("Switched camera to {}", target);
                Ok(target)
            }
        }
    }

    /// Beendet den aktuellen Anruf (`→ Ended → Idle`)
    ///
    /// Gibt die beendete Session zurück; im Idle-Zustand passiert nichts.
    pub async fn end_call(&self) -> Option<CallSession> {
        let (session, peer, media) = {
            let mut inner = self.core.inner.lock();
            if matches!(
                inner.state,
                CallState::Idle | CallState::Ended | CallState::Failed
            ) {
                return None;
            }
            inner.epoch += 1;
            inner.state = CallState::Ended;
            inner.candidates.reset();
            (inner.session.take(), inner.peer.take(), inner.local_media.take())
        };

        tracing::info!("Ending call");
        self.core.emit(CallEvent::StateChanged(CallState::Ended));

        release(peer, media).await;
        self.core.settle_idle();
        session
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn begin_session(&self, state: CallState, session: CallSession) -> Result<u64, CallError> {
        let epoch = {
            let mut inner = self.core.inner.lock();
            if inner.state != CallState::Idle {
                return Err(CallError::AlreadyInCall);
            }
            inner.epoch += 1;
            inner.state = state;
            inner.session = Some(session);
            inner.peer = None;
            inner.local_media = None;
            inner.candidates.reset();
            inner.answering = false;
            inner.muted = false;
            inner.camera_off = false;
            inner.epoch
        };

        self.core.emit(CallEvent::StateChanged(state));
        Ok(epoch)
    }

    async fn negotiate_offer(
        &self,
        epoch: u64,
        kind: MediaKind,
        existing_media: Option<LocalMedia>,
    ) -> Result<SessionDescription, CallError> {
        let media = self.attach_media(epoch, kind, existing_media).await?;
        let peer = self.attach_peer(epoch).await?;

        for track in media.tracks() {
            peer.add_track(Arc::clone(track)).await?;
        }

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.core.ensure_current(epoch)?;
        Ok(offer)
    }

    async fn negotiate_answer(
        &self,
        epoch: u64,
        kind: MediaKind,
        offer: SessionDescription,
        existing_media: Option<LocalMedia>,
    ) -> Result<SessionDescription, CallError> {
        let media = self.attach_media(epoch, kind, existing_media).await?;
        let peer = self.attach_peer(epoch).await?;

        peer.set_remote_description(offer).await?;
        self.drain_candidates(epoch, &peer).await?;

        for track in media.tracks() {
            peer.add_track(Arc::clone(track)).await?;
        }

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.mark_answered(epoch)?;
        Ok(answer)
    }

    /// Medien holen; war die Session inzwischen beendet, werden sie verworfen
    async fn attach_media(
        &self,
        epoch: u64,
        kind: MediaKind,
        existing_media: Option<LocalMedia>,
    ) -> Result<LocalMedia, CallError> {
        let media = match existing_media {
            Some(media) => media,
            None => self.devices.acquire(kind, None).await?,
        };

        let stored = {
            let mut inner = self.core.inner.lock();
            if inner.epoch == epoch {
                inner.local_media = Some(media.clone());
                true
            } else {
                false
            }
        };

        if !stored {
            tracing::debug!("Discarding media acquired for a call that already ended");
            media.stop_all();
            return Err(CallError::Cancelled);
        }
        Ok(media)
    }

    async fn attach_peer(&self, epoch: u64) -> Result<Arc<dyn PeerSession>, CallError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let peer = self.peers.create(event_tx).await?;

        let stored = {
            let mut inner = self.core.inner.lock();
            if inner.epoch == epoch {
                inner.peer = Some(Arc::clone(&peer));
                true
            } else {
                false
            }
        };

        if !stored {
            peer.close().await;
            return Err(CallError::Cancelled);
        }

        spawn_peer_pump(Arc::downgrade(&self.core), epoch, event_rx);
        Ok(peer)
    }

    /// Wendet gepufferte Candidates in Ankunftsreihenfolge an
    async fn drain_candidates(&self, epoch: u64, peer: &Arc<dyn PeerSession>) -> Result<(), CallError> {
        {
            let mut inner = self.core.inner.lock();
            if inner.epoch != epoch {
                return Err(CallError::Cancelled);
            }
            inner.candidates.begin_drain();
        }

        let mut drained = 0usize;
        loop {
            let next = {
                let mut inner = self.core.inner.lock();
                if inner.epoch != epoch {
                    return Err(CallError::Cancelled);
                }
                inner.candidates.next_for_drain()
            };
            let Some(candidate) = next else {
                break;
            };
            apply_candidate(peer, candidate).await;
            drained += 1;
        }

        if drained > 0 {
            tracing::debug!("Applied {} queued ICE candidate(s)", drained);
        }
        Ok(())
    }

    fn mark_answered(&self, epoch: u64) -> Result<(), CallError> {
        let mut inner = self.core.inner.lock();
        if inner.epoch != epoch {
            return Err(CallError::Cancelled);
        }
        if let Some(session) = inner.session.as_mut() {
            session.answered_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    /// Fehlerpfad: Session auf `Failed` setzen, außer sie ist schon weg
    async fn abort(&self, epoch: u64, error: CallError) -> CallError {
        if error != CallError::Cancelled {
            self.core.fail(epoch, error.clone()).await;
        }
        error
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("CallEngine")
            .field("state", &inner.state)
            .field("session", &inner.session)
            .field("is_muted", &inner.muted)
            .field("camera_off", &inner.camera_off)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::media::RtcTrack;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::oneshot;

    // ------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct PeerLog {
        applied: Vec<String>,
        remote: Option<SessionDescription>,
        local: Option<SessionDescription>,
        tracks: Vec<MediaKind>,
        replaced: Vec<Option<String>>,
        closed: usize,
    }

    struct FakePeer {
        log: Arc<Mutex<PeerLog>>,
        events: mpsc::UnboundedSender<PeerEvent>,
    }

    impl FakePeer {
        /// Meldet "connected", sobald beide Descriptions gesetzt sind
        fn maybe_connected(&self) {
            let ready = {
                let log = self.log.lock();
                log.remote.is_some() && log.local.is_some()
            };
            if ready {
                let _ = self
                    .events
                    .send(PeerEvent::StateChanged(PeerConnectionState::Connected));
            }
        }
    }

    #[async_trait]
    impl PeerSession for FakePeer {
        async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError> {
            self.log.lock().tracks.push(track.kind());
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
            Ok(SessionDescription::offer("fake-offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            Ok(SessionDescription::answer("fake-answer"))
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
            self.log.lock().local = Some(desc);
            self.maybe_connected();
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
            if desc.sdp.is_empty() {
                return Err(NegotiationError::InvalidSdp("empty".to_string()));
            }
            self.log.lock().remote = Some(desc);
            self.maybe_connected();
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
            let mut log = self.log.lock();
            if log.remote.is_none() {
                panic!("candidate applied before remote description");
            }
            if candidate.candidate.contains("bad") {
                return Err(NegotiationError::InvalidCandidate(candidate.candidate));
            }
            log.applied.push(candidate.candidate);
            Ok(())
        }

        async fn replace_video_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), NegotiationError> {
            self.log
                .lock()
                .replaced
                .push(track.device_id().map(str::to_string));
            Ok(())
        }

        async fn close(&self) {
            self.log.lock().closed += 1;
        }
    }

    #[derive(Default)]
    struct FakePeerFactory {
        log: Arc<Mutex<PeerLog>>,
        events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    }

    impl FakePeerFactory {
        fn inject(&self, event: PeerEvent) {
            if let Some(tx) = self.events.lock().as_ref() {
                tx.send(event).unwrap();
            }
        }
    }

    #[async_trait]
    impl PeerFactory for FakePeerFactory {
        async fn create(
            &self,
            events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Arc<dyn PeerSession>, NegotiationError> {
            *self.events.lock() = Some(events.clone());
            Ok(Arc::new(FakePeer {
                log: Arc::clone(&self.log),
                events,
            }))
        }
    }

    struct FakeDevices {
        cameras: Vec<MediaDeviceInfo>,
        error: Mutex<Option<MediaError>>,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        acquired: Mutex<Vec<LocalMedia>>,
        /// Audio-Tracks der Aufnahmen, zum Schreiben von Paketen
        audio: Mutex<Vec<Arc<RtcTrack>>>,
    }

    impl FakeDevices {
        fn new() -> Self {
            let camera = |id: &str| MediaDeviceInfo {
                device_id: id.to_string(),
                label: format!("{id} camera"),
                kind: MediaKind::Video,
            };
            Self {
                cameras: vec![camera("front"), camera("rear")],
                error: Mutex::new(None),
                gate: Mutex::new(None),
                acquired: Mutex::new(Vec::new()),
                audio: Mutex::new(Vec::new()),
            }
        }

        /// Hält die nächste Aufnahme an, bis der Sender auslöst
        fn hold(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            *self.gate.lock() = Some(rx);
            tx
        }
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn acquire(&self, kind: MediaKind, camera: Option<&str>) -> Result<LocalMedia, MediaError> {
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if let Some(error) = self.error.lock().clone() {
                return Err(error);
            }

            let audio = Arc::new(RtcTrack::new(MediaKind::Audio, None));
            self.audio.lock().push(Arc::clone(&audio));
            let mut tracks: Vec<Arc<dyn MediaTrack>> = vec![audio as Arc<dyn MediaTrack>];
            if kind == MediaKind::Video {
                let device = camera.unwrap_or("front").to_string();
                tracks.push(Arc::new(RtcTrack::new(MediaKind::Video, Some(device))));
            }
            let media = LocalMedia::new(tracks);
            self.acquired.lock().push(media.clone());
            Ok(media)
        }

        async fn cameras(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
            Ok(self.cameras.clone())
        }

        async fn open_camera(&self, device_id: &str) -> Result<Arc<dyn MediaTrack>, MediaError> {
            Ok(Arc::new(RtcTrack::new(MediaKind::Video, Some(device_id.to_string()))))
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn engine() -> (Arc<CallEngine>, Arc<FakeDevices>, Arc<FakePeerFactory>) {
        let devices = Arc::new(FakeDevices::new());
        let peers = Arc::new(FakePeerFactory::default());
        let engine = Arc::new(CallEngine::new(devices.clone(), peers.clone()));
        (engine, devices, peers)
    }

    fn candidate(label: &str) -> IceCandidate {
        IceCandidate {
            candidate: label.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn wait_for_state(rx: &mut broadcast::Receiver<CallEvent>, target: CallState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let CallEvent::StateChanged(state) = rx.recv().await.unwrap() {
                    if state == target {
                        return;
                    }
                }
            }
        })
        .await
        .expect("state never reached");
    }

    fn operator() -> RemoteParty {
        RemoteParty::new("u-42").with_name("Press line 2")
    }

    // ------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_caller_connects_after_answer() {
        let (engine, _devices, peers) = engine();
        let mut events = engine.subscribe();

        let offer = engine.start_call(operator(), MediaKind::Video, None).await.unwrap();
        assert_eq!(offer, SessionDescription::offer("fake-offer"));
        assert_eq!(engine.state(), CallState::Calling);
        assert_eq!(peers.log.lock().tracks, vec![MediaKind::Audio, MediaKind::Video]);

        let session = engine.session().unwrap();
        assert_eq!(session.direction, CallDirection::Outgoing);
        assert!(session.answered_at.is_none());

        engine
            .handle_answer(SessionDescription::answer("remote-answer"))
            .await
            .unwrap();
        wait_for_state(&mut events, CallState::Connected).await;
        assert_eq!(engine.state(), CallState::Connected);
        assert!(engine.session().unwrap().answered_at.is_some());
    }

    #[tokio::test]
    async fn test_early_candidates_applied_after_remote_description_in_order() {
        let (engine, _devices, peers) = engine();
        let mut events = engine.subscribe();

        engine.register_incoming("call-1", operator(), MediaKind::Video).unwrap();
        engine.add_ice_candidate(candidate("c1")).await;
        engine.add_ice_candidate(candidate("c2")).await;
        assert!(peers.log.lock().applied.is_empty());

        let answer = engine
            .answer_call(SessionDescription::offer("remote-offer"), None)
            .await
            .unwrap();
        assert_eq!(answer, SessionDescription::answer("fake-answer"));
        assert_eq!(peers.log.lock().applied, vec!["c1", "c2"]);

        engine.add_ice_candidate(candidate("c3")).await;
        assert_eq!(peers.log.lock().applied, vec!["c1", "c2", "c3"]);

        wait_for_state(&mut events, CallState::Connected).await;
    }

    #[tokio::test]
    async fn test_candidates_during_media_acquisition_are_queued() {
        let (engine, devices, peers) = engine();
        engine.register_incoming("call-2", operator(), MediaKind::Audio).unwrap();

        let release = devices.hold();
        let answering = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .answer_call(SessionDescription::offer("remote-offer"), None)
                    .await
            })
        };
        tokio::task::yield_now().await;

        engine.add_ice_candidate(candidate("c1")).await;
        engine.add_ice_candidate(candidate("bad-one")).await;
        engine.add_ice_candidate(candidate("c3")).await;
        release.send(()).unwrap();

        answering.await.unwrap().unwrap();
        assert_eq!(peers.log.lock().applied, vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn test_second_session_is_rejected() {
        let (engine, _devices, _peers) = engine();
        engine.start_call(operator(), MediaKind::Audio, None).await.unwrap();

        assert_eq!(
            engine.start_call(operator(), MediaKind::Audio, None).await,
            Err(CallError::AlreadyInCall)
        );
        assert_eq!(
            engine.register_incoming("call-9", RemoteParty::new("u-9"), MediaKind::Audio),
            Err(CallError::AlreadyInCall)
        );
        assert_eq!(engine.state(), CallState::Calling);
    }

    #[tokio::test]
    async fn test_answer_requires_ringing() {
        let (engine, _devices, _peers) = engine();
        assert_eq!(
            engine
                .answer_call(SessionDescription::offer("remote-offer"), None)
                .await,
            Err(CallError::InvalidState(CallState::Idle))
        );
        assert_eq!(
            engine.handle_answer(SessionDescription::answer("x")).await,
            Err(CallError::NoActiveCall)
        );
    }

    #[tokio::test]
    async fn test_media_failure_fails_then_returns_to_idle() {
        let (engine, devices, _peers) = engine();
        *devices.error.lock() = Some(MediaError::PermissionDenied("camera blocked".to_string()));
        let mut events = engine.subscribe();

        let result = engine.start_call(operator(), MediaKind::Video, None).await;
        assert_eq!(
            result,
            Err(CallError::Media(MediaError::PermissionDenied("camera blocked".to_string())))
        );
        assert_eq!(engine.state(), CallState::Idle);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                CallEvent::StateChanged(state) => seen.push(format!("{state:?}")),
                CallEvent::Failed { session, error } => {
                    assert_eq!(session.unwrap().remote.user_id, "u-42");
                    assert!(matches!(error, CallError::Media(MediaError::PermissionDenied(_))));
                    seen.push("failed-event".to_string());
                }
                _ => {}
            }
        }
        assert_eq!(seen, vec!["Calling", "Failed", "failed-event", "Idle"]);
    }

    #[tokio::test]
    async fn test_invalid_answer_fails_call() {
        let (engine, _devices, peers) = engine();
        engine.start_call(operator(), MediaKind::Audio, None).await.unwrap();

        let result = engine.handle_answer(SessionDescription::answer("")).await;
        assert!(matches!(result, Err(CallError::Negotiation(NegotiationError::InvalidSdp(_)))));
        assert_eq!(engine.state(), CallState::Idle);
        assert_eq!(peers.log.lock().closed, 1);
    }

    #[tokio::test]
    async fn test_end_call_from_any_state() {
        let (engine, _devices, peers) = engine();
        assert_eq!(engine.end_call().await, None);

        engine.register_incoming("call-3", operator(), MediaKind::Audio).unwrap();
        let ended = engine.end_call().await.unwrap();
        assert_eq!(ended.call_id, "call-3");
        assert_eq!(engine.state(), CallState::Idle);

        engine.start_call(operator(), MediaKind::Video, None).await.unwrap();
        let media = engine.local_media().unwrap();
        engine.add_ice_candidate(candidate("late")).await;

        assert!(engine.end_call().await.is_some());
        assert_eq!(engine.state(), CallState::Idle);
        assert!(media.tracks().iter().all(|t| t.is_stopped()));
        assert_eq!(peers.log.lock().closed, 1);
        assert!(engine.local_media().is_none());
    }

    #[tokio::test]
    async fn test_end_during_media_acquisition_discards_media() {
        let (engine, devices, _peers) = engine();
        let mut events = engine.subscribe();

        let release = devices.hold();
        let calling = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.start_call(operator(), MediaKind::Video, None).await })
        };
        wait_for_state(&mut events, CallState::Calling).await;

        assert!(engine.end_call().await.is_some());
        release.send(()).unwrap();

        assert_eq!(calling.await.unwrap(), Err(CallError::Cancelled));
        assert_eq!(engine.state(), CallState::Idle);
        let acquired = devices.acquired.lock().clone();
        assert_eq!(acquired.len(), 1);
        assert!(acquired[0].tracks().iter().all(|t| t.is_stopped()));
    }

    #[tokio::test]
    async fn test_mute_and_camera_toggles() {
        let (engine, _devices, _peers) = engine();
        assert_eq!(engine.toggle_microphone(), Err(CallError::NoActiveCall));

        engine.start_call(operator(), MediaKind::Video, None).await.unwrap();
        let media = engine.local_media().unwrap();

        assert_eq!(engine.toggle_microphone(), Ok(true));
        assert!(media.audio_tracks().all(|t| !t.is_enabled()));
        assert_eq!(engine.toggle_microphone(), Ok(false));
        assert!(media.audio_tracks().all(|t| t.is_enabled()));

        assert_eq!(engine.toggle_camera(), Ok(true));
        assert!(!media.video_track().unwrap().is_enabled());
        assert!(engine.is_camera_off());

        engine.end_call().await;
        engine.start_call(operator(), MediaKind::Audio, None).await.unwrap();
        assert_eq!(engine.toggle_camera(), Err(CallError::NoVideoTrack));
        assert!(!engine.is_muted());
    }

    #[tokio::test]
    async fn test_muted_microphone_sends_no_packets() {
        let (engine, devices, _peers) = engine();
        engine.start_call(operator(), MediaKind::Audio, None).await.unwrap();
        let audio = devices.audio.lock()[0].clone();
        let packet = webrtc::rtp::packet::Packet::default();

        assert!(audio.write_rtp(&packet).await.unwrap());
        assert_eq!(engine.toggle_microphone(), Ok(true));
        for _ in 0..3 {
            assert!(!audio.write_rtp(&packet).await.unwrap());
        }
        assert_eq!(audio.packets_sent(), 1);

        assert_eq!(engine.toggle_microphone(), Ok(false));
        assert!(audio.write_rtp(&packet).await.unwrap());
        assert_eq!(audio.packets_sent(), 2);
    }

    #[tokio::test]
    async fn test_switch_camera_cycles_and_replaces_sender_track() {
        let (engine, _devices, peers) = engine();
        engine.start_call(operator(), MediaKind::Video, None).await.unwrap();
        let original = engine.local_media().unwrap().video_track().cloned().unwrap();

        assert_eq!(engine.switch_camera(None).await.unwrap(), "rear");
        assert!(original.is_stopped());
        assert_eq!(
            engine.local_media().unwrap().video_track().unwrap().device_id(),
            Some("rear")
        );

        assert_eq!(engine.switch_camera(None).await.unwrap(), "front");
        assert_eq!(engine.switch_camera(Some("rear")).await.unwrap(), "rear");
        assert_eq!(
            peers.log.lock().replaced,
            vec![
                Some("rear".to_string()),
                Some("front".to_string()),
                Some("rear".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_peer_connectivity_failure() {
        let (engine, _devices, peers) = engine();
        let mut events = engine.subscribe();

        engine.start_call(operator(), MediaKind::Audio, None).await.unwrap();
        engine
            .handle_answer(SessionDescription::answer("remote-answer"))
            .await
            .unwrap();
        wait_for_state(&mut events, CallState::Connected).await;

        peers.inject(PeerEvent::StateChanged(PeerConnectionState::Failed));
        wait_for_state(&mut events, CallState::Failed).await;
        wait_for_state(&mut events, CallState::Idle).await;
        assert_eq!(engine.state(), CallState::Idle);
        assert_eq!(peers.log.lock().closed, 1);
    }

    #[tokio::test]
    async fn test_local_candidates_and_remote_tracks_are_forwarded() {
        let (engine, _devices, peers) = engine();
        let mut events = engine.subscribe();
        engine.start_call(operator(), MediaKind::Audio, None).await.unwrap();

        peers.inject(PeerEvent::LocalCandidate(candidate("local-1")));
        peers.inject(PeerEvent::RemoteTrack {
            kind: MediaKind::Audio,
            track_id: "remote-audio".to_string(),
        });

        let mut forwarded = Vec::new();
        while forwarded.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                CallEvent::LocalCandidate(c) => forwarded.push(c.candidate),
                CallEvent::RemoteTrack { track_id, .. } => forwarded.push(track_id),
                _ => {}
            }
        }
        assert_eq!(forwarded, vec!["local-1", "remote-audio"]);
    }

    #[test]
    fn test_next_camera_wraps_around() {
        let cams = FakeDevices::new().cameras;
        assert_eq!(next_camera(&cams, Some("front")).as_deref(), Some("rear"));
        assert_eq!(next_camera(&cams, Some("rear")).as_deref(), Some("front"));
        assert_eq!(next_camera(&cams, Some("unknown")).as_deref(), Some("front"));
        assert_eq!(next_camera(&[], None), None);
    }
}
