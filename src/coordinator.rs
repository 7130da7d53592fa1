//! Call Session Coordinator
//!
//! Verbindet den Signaling-Kanal mit der [`CallEngine`]:
//! - `call:*` Nachrichten werden in Engine-Operationen übersetzt
//! - Offers, Answers und lokale Candidates gehen per Signaling raus
//! - Klingel-Timeout und Gesprächsdauer
//! - genau ein [`CallRecord`] pro Anruf
//!
//! Anrufe sollten über den Coordinator beendet werden (`hang_up`, `decline`),
//! nicht direkt über die Engine.

use crate::call_engine::{
    CallDirection, CallEngine, CallError, CallEvent, CallSession, CallState, IceCandidate,
    MediaKind, RemoteParty, SessionDescription,
};
use crate::config::CallOptions;
use crate::database::{CallLog, CallOutcome, CallRecord};
use crate::signaling::{
    actions, AnswerSignal, ConnectionManager, EventKey, HangupSignal, IceCandidateSignal,
    InboundMessage, OfferSignal, SubscriptionId,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Signaling-Actions, die der Coordinator verarbeitet
const CALL_ACTIONS: [&str; 5] = [
    actions::CALL_OFFER,
    actions::CALL_ANSWER,
    actions::CALL_ICE_CANDIDATE,
    actions::CALL_REJECT,
    actions::CALL_END,
];

const REASON_BUSY: &str = "busy";
const REASON_DECLINED: &str = "declined";
const REASON_TIMEOUT: &str = "timeout";
const REASON_FAILED: &str = "failed";

// ============================================================================
// NOTIFICATIONS
// ============================================================================

/// Lebenszyklus-Events für die UI
#[derive(Debug, Clone)]
pub enum CallNotification {
    /// Eingehender Anruf klingelt
    Incoming(CallSession),
    /// Offer ist raus, es klingelt beim Gegenüber
    Ringing(CallSession),
    Answered(CallSession),
    Connected(CallSession),
    /// Gesprächsdauer in Sekunden, einmal pro Sekunde
    Duration { call_id: String, secs: u64 },
    RemoteTrack { kind: MediaKind, track_id: String },
    /// Offer während eines laufenden Anrufs, automatisch abgelehnt
    BusyRejected(CallRecord),
    Ended(CallRecord),
    Failed { record: CallRecord, reason: String },
}

// ============================================================================
// STATE
// ============================================================================

/// Der Anruf, den auch die Gegenseite kennt
struct ActiveCall {
    call_id: String,
    remote: RemoteParty,
    direction: CallDirection,
    /// Eingehendes Offer bis `accept()`
    offer: Option<SessionDescription>,
    answered: Option<Instant>,
    /// Klingel- und Dauer-Timer dieses Anrufs
    timers: CancellationToken,
}

impl ActiveCall {
    fn new(session: &CallSession, offer: Option<SessionDescription>) -> Self {
        Self {
            call_id: session.call_id.clone(),
            remote: session.remote.clone(),
            direction: session.direction,
            offer,
            answered: None,
            timers: CancellationToken::new(),
        }
    }

    fn is_unanswered(&self) -> bool {
        match self.direction {
            CallDirection::Incoming => self.offer.is_some(),
            CallDirection::Outgoing => self.answered.is_none(),
        }
    }
}

struct Attachment {
    token: CancellationToken,
    subscriptions: Vec<(EventKey, SubscriptionId)>,
}

#[derive(Default)]
struct State {
    active: Option<ActiveCall>,
    /// Lokale Candidates, die vor dem Offer entstanden sind
    held_candidates: Vec<(String, IceCandidate)>,
    attachment: Option<Attachment>,
}

struct Inner {
    signaling: ConnectionManager,
    engine: Arc<CallEngine>,
    log: Arc<CallLog>,
    options: CallOptions,
    notify_tx: broadcast::Sender<CallNotification>,
    state: Mutex<State>,
}

// ============================================================================
// CALL COORDINATOR
// ============================================================================

#[derive(Clone)]
pub struct CallCoordinator {
    inner: Arc<Inner>,
}

impl CallCoordinator {
    pub fn new(
        signaling: ConnectionManager,
        engine: Arc<CallEngine>,
        log: Arc<CallLog>,
        options: CallOptions,
    ) -> Self {
        let (notify_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(Inner {
                signaling,
                engine,
                log,
                options,
                notify_tx,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.inner.notify_tx.subscribe()
    }

    pub fn engine(&self) -> &Arc<CallEngine> {
        &self.inner.engine
    }

    pub fn signaling(&self) -> &ConnectionManager {
        &self.inner.signaling
    }

    pub fn log(&self) -> &Arc<CallLog> {
        &self.inner.log
    }

    /// Anrufverlauf, neueste zuerst
    pub fn history(&self) -> Vec<CallRecord> {
        self.inner.log.records()
    }

    pub fn current_call(&self) -> Option<CallSession> {
        self.inner.engine.session()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.state.lock().attachment.is_some()
    }

    /// Startet die Verarbeitung von Signaling- und Engine-Events
    ///
    /// Ein erneuter Aufruf ersetzt die vorherige Verarbeitung.
    pub fn attach(&self) {
        self.detach();

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let subscriptions = CALL_ACTIONS
            .iter()
            .map(|action| {
                let tx = signal_tx.clone();
                let key = EventKey::from(*action);
                let id = self.inner.signaling.on(key.clone(), move |message| {
                    let _ = tx.send(message.clone());
                });
                (key, id)
            })
            .collect();

        let engine_events = self.inner.engine.subscribe();
        let token = CancellationToken::new();
        self.inner.state.lock().attachment = Some(Attachment {
            token: token.clone(),
            subscriptions,
        });

        tokio::spawn(self.clone().run(token, signal_rx, engine_events));
    }

    /// Beendet die Verarbeitung; ein laufender Anruf bleibt bestehen
    pub fn detach(&self) {
        let (attachment, timers) = {
            let mut state = self.inner.state.lock();
            (
                state.attachment.take(),
                state.active.as_ref().map(|a| a.timers.clone()),
            )
        };

        let Some(attachment) = attachment else {
            return;
        };
        attachment.token.cancel();
        if let Some(timers) = timers {
            timers.cancel();
        }
        for (key, id) in attachment.subscriptions {
            self.inner.signaling.off(&key, id);
        }
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    /// Ruft `remote` an und sendet das Offer
    pub async fn start_call(&self, remote: RemoteParty, kind: MediaKind) -> Result<CallSession, CallError> {
        let offer = self.inner.engine.start_call(remote, kind, None).await?;
        let session = self.inner.engine.session().ok_or(CallError::Cancelled)?;

        let active = ActiveCall::new(&session, None);
        let timers = active.timers.clone();
        let held = {
            let mut state = self.inner.state.lock();
            state.active = Some(active);
            let (held, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.held_candidates)
                .into_iter()
                .partition(|(call_id, _)| *call_id == session.call_id);
            state.held_candidates = rest;
            held
        };

        self.send_signal(
            actions::CALL_OFFER,
            &OfferSignal::new(session.remote.user_id.clone(), session.call_id.clone(), kind, offer),
        );
        for (call_id, candidate) in held {
            self.send_signal(
                actions::CALL_ICE_CANDIDATE,
                &IceCandidateSignal::new(session.remote.user_id.clone(), call_id, candidate),
            );
        }

        self.spawn_ring_timer(session.call_id.clone(), timers);
        self.notify(CallNotification::Ringing(session.clone()));
        Ok(session)
    }

    /// Nimmt den klingelnden Anruf an und sendet das Answer
    pub async fn accept(&self) -> Result<CallSession, CallError> {
        let engine_state = self.inner.engine.state();
        let (call_id, target, offer) = {
            let mut state = self.inner.state.lock();
            let active = state.active.as_mut().ok_or(CallError::NoActiveCall)?;
            if active.direction != CallDirection::Incoming {
                return Err(CallError::InvalidState(engine_state));
            }
            let offer = active.offer.take().ok_or(CallError::InvalidState(engine_state))?;
            (active.call_id.clone(), active.remote.user_id.clone(), offer)
        };

        // Fehler landen als CallEvent::Failed in der Event-Schleife
        let answer = self.inner.engine.answer_call(offer, None).await?;
        self.send_signal(
            actions::CALL_ANSWER,
            &AnswerSignal::new(target, call_id.clone(), answer),
        );

        let session = self.inner.engine.session().ok_or(CallError::Cancelled)?;
        self.mark_answered(&call_id);
        self.notify(CallNotification::Answered(session.clone()));
        Ok(session)
    }

    /// Lehnt den klingelnden Anruf ab
    pub async fn decline(&self, reason: Option<&str>) -> Result<(), CallError> {
        let engine_state = self.inner.engine.state();
        let (call_id, target) = {
            let state = self.inner.state.lock();
            match state.active.as_ref() {
                Some(active) if active.direction == CallDirection::Incoming && active.offer.is_some() => {
                    (active.call_id.clone(), active.remote.user_id.clone())
                }
                Some(_) => return Err(CallError::InvalidState(engine_state)),
                None => return Err(CallError::NoActiveCall),
            }
        };

        tracing::info!("Declining call {}", call_id);
        self.send_signal(
            actions::CALL_REJECT,
            &HangupSignal::new(target, call_id.clone(), Some(reason.unwrap_or(REASON_DECLINED).to_string())),
        );

        match self.inner.engine.end_call().await {
            Some(session) => {
                self.finish(session, CallOutcome::Rejected, None);
            }
            None => {
                self.take_active(&call_id);
            }
        }
        Ok(())
    }

    /// Legt auf; im Idle-Zustand passiert nichts
    pub async fn hang_up(&self) -> Option<CallRecord> {
        let session = self.inner.engine.end_call().await?;
        let active = self.take_active(&session.call_id);

        if active.is_some() {
            self.send_signal(
                actions::CALL_END,
                &HangupSignal::new(session.remote.user_id.clone(), session.call_id.clone(), None),
            );
        }
        self.record(session, active.as_ref(), CallOutcome::Completed, None)
    }

    // ========================================================================
    // EVENT LOOP
    // ========================================================================

    async fn run(
        self,
        token: CancellationToken,
        mut signals: mpsc::UnboundedReceiver<InboundMessage>,
        mut engine_events: broadcast::Receiver<CallEvent>,
    ) {
        tracing::debug!("Call coordinator attached");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(message) = signals.recv() => self.on_signal(message).await,
                event = engine_events.recv() => match event {
                    Ok(event) => self.on_engine_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Coordinator missed {} engine event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        tracing::debug!("Call coordinator detached");
    }

    async fn on_signal(&self, message: InboundMessage) {
        match message.event_type() {
            Some(actions::CALL_OFFER) => self.on_offer(&message),
            Some(actions::CALL_ANSWER) => self.on_answer(&message).await,
            Some(actions::CALL_ICE_CANDIDATE) => self.on_remote_candidate(&message).await,
            Some(actions::CALL_REJECT) => self.on_remote_hangup(&message, CallOutcome::Rejected).await,
            Some(actions::CALL_END) => self.on_remote_hangup(&message, CallOutcome::Completed).await,
            other => tracing::debug!("Ignoring signal {:?}", other),
        }
    }

    fn on_offer(&self, message: &InboundMessage) {
        let offer: OfferSignal = match message.payload() {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!("Malformed call offer: {}", e);
                return;
            }
        };
        let Some(from) = offer.from_user_id.clone() else {
            tracing::warn!("Ignoring call offer {} without sender", offer.call_id);
            return;
        };
        if self.current_call_id(Some(&offer.call_id), None).is_some() {
            tracing::debug!("Ignoring repeated offer for active call {}", offer.call_id);
            return;
        }

        let mut remote = RemoteParty::new(from);
        if let Some(name) = offer.from_name.clone() {
            remote = remote.with_name(name);
        }

        let busy = self.inner.state.lock().active.is_some();
        let registered = if busy {
            Err(CallError::AlreadyInCall)
        } else {
            self.inner
                .engine
                .register_incoming(offer.call_id.clone(), remote.clone(), offer.call_type)
        };

        match registered {
            Ok(session) => {
                let active = ActiveCall::new(&session, Some(offer.offer));
                let timers = active.timers.clone();
                self.inner.state.lock().active = Some(active);

                self.spawn_ring_timer(session.call_id.clone(), timers);
                self.notify(CallNotification::Incoming(session));
            }
            Err(CallError::AlreadyInCall) => self.reject_busy(offer.call_id, remote, offer.call_type),
            Err(e) => tracing::warn!("Could not register incoming call: {}", e),
        }
    }

    fn reject_busy(&self, call_id: String, remote: RemoteParty, kind: MediaKind) {
        tracing::info!("Busy, rejecting call {} from {}", call_id, remote.label());
        self.send_signal(
            actions::CALL_REJECT,
            &HangupSignal::new(remote.user_id.clone(), call_id.clone(), Some(REASON_BUSY.to_string())),
        );

        let record = CallRecord::new(call_id, remote, CallDirection::Incoming, kind, CallOutcome::Missed, 0);
        if self.inner.log.append(record.clone()) {
            self.notify(CallNotification::BusyRejected(record));
        }
    }

    async fn on_answer(&self, message: &InboundMessage) {
        let answer: AnswerSignal = match message.payload() {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("Malformed call answer: {}", e);
                return;
            }
        };
        let Some(call_id) = self.current_call_id(answer.call_id.as_deref(), answer.from_user_id.as_deref()) else {
            tracing::debug!("Ignoring answer for unknown call {:?}", answer.call_id);
            return;
        };

        match self.inner.engine.handle_answer(answer.answer).await {
            Ok(()) => {
                self.mark_answered(&call_id);
                if let Some(session) = self.inner.engine.session() {
                    self.notify(CallNotification::Answered(session));
                }
            }
            Err(e) => tracing::warn!("Failed to apply answer for call {}: {}", call_id, e),
        }
    }

    async fn on_remote_candidate(&self, message: &InboundMessage) {
        let signal: IceCandidateSignal = match message.payload() {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!("Malformed ICE candidate signal: {}", e);
                return;
            }
        };
        if self.current_call_id(signal.call_id.as_deref(), signal.from_user_id.as_deref()).is_none() {
            tracing::debug!("Dropping ICE candidate for unknown call {:?}", signal.call_id);
            return;
        }

        self.inner.engine.add_ice_candidate(signal.candidate).await;
    }

    async fn on_remote_hangup(&self, message: &InboundMessage, outcome: CallOutcome) {
        let signal: HangupSignal = match message.payload() {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!("Malformed hangup signal: {}", e);
                return;
            }
        };
        let Some(call_id) = self.current_call_id(signal.call_id.as_deref(), signal.from_user_id.as_deref()) else {
            tracing::debug!("Ignoring hangup for unknown call {:?}", signal.call_id);
            return;
        };

        tracing::info!(
            "Call {} {} by remote (reason: {})",
            call_id,
            if outcome == CallOutcome::Rejected { "rejected" } else { "ended" },
            signal.reason.as_deref().unwrap_or("none")
        );

        match self.inner.engine.end_call().await {
            Some(session) => {
                self.finish(session, outcome, None);
            }
            None => {
                self.take_active(&call_id);
            }
        }
    }

    async fn on_engine_event(&self, event: CallEvent) {
        match event {
            CallEvent::StateChanged(CallState::Connected) => {
                if let Some(session) = self.inner.engine.session() {
                    self.notify(CallNotification::Connected(session));
                }
            }
            CallEvent::StateChanged(_) => {}
            CallEvent::LocalCandidate(candidate) => self.forward_local_candidate(candidate),
            CallEvent::RemoteTrack { kind, track_id } => {
                self.notify(CallNotification::RemoteTrack { kind, track_id });
            }
            CallEvent::Failed { session, error } => {
                let Some(session) = session else {
                    return;
                };
                let active = self.take_active(&session.call_id);
                if active.is_some() {
                    self.send_signal(
                        actions::CALL_END,
                        &HangupSignal::new(
                            session.remote.user_id.clone(),
                            session.call_id.clone(),
                            Some(REASON_FAILED.to_string()),
                        ),
                    );
                }
                self.record(session, active.as_ref(), CallOutcome::Failed, Some(error.to_string()));
            }
        }
    }

    fn forward_local_candidate(&self, candidate: IceCandidate) {
        let Some(session) = self.inner.engine.session() else {
            return;
        };

        let target = {
            let mut state = self.inner.state.lock();
            match state.active.as_ref() {
                Some(active) if active.call_id == session.call_id => Some(active.remote.user_id.clone()),
                _ => {
                    state
                        .held_candidates
                        .push((session.call_id.clone(), candidate.clone()));
                    None
                }
            }
        };

        if let Some(target) = target {
            self.send_signal(
                actions::CALL_ICE_CANDIDATE,
                &IceCandidateSignal::new(target, session.call_id, candidate),
            );
        }
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    fn spawn_ring_timer(&self, call_id: String, timers: CancellationToken) {
        let this = self.clone();
        let ring_timeout = self.inner.options.ring_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = timers.cancelled() => {}
                _ = time::sleep(ring_timeout) => this.ring_timed_out(&call_id).await,
            }
        });
    }

    async fn ring_timed_out(&self, call_id: &str) {
        let unanswered = self
            .inner
            .state
            .lock()
            .active
            .as_ref()
            .is_some_and(|a| a.call_id == call_id && a.is_unanswered());
        let current = self
            .inner
            .engine
            .session()
            .is_some_and(|s| s.call_id == call_id);
        if !unanswered || !current {
            return;
        }

        tracing::info!(
            "Call {} not answered within {:?}",
            call_id,
            self.inner.options.ring_timeout
        );

        let Some(session) = self.inner.engine.end_call().await else {
            self.take_active(call_id);
            return;
        };
        let active = self.take_active(&session.call_id);

        if active
            .as_ref()
            .is_some_and(|a| a.direction == CallDirection::Outgoing)
        {
            self.send_signal(
                actions::CALL_END,
                &HangupSignal::new(
                    session.remote.user_id.clone(),
                    session.call_id.clone(),
                    Some(REASON_TIMEOUT.to_string()),
                ),
            );
        }
        self.record(session, active.as_ref(), CallOutcome::Missed, None);
    }

    /// Merkt sich den Annahmezeitpunkt und startet den Dauer-Timer
    fn mark_answered(&self, call_id: &str) {
        let timers = {
            let mut state = self.inner.state.lock();
            match state.active.as_mut() {
                Some(active) if active.call_id == call_id && active.answered.is_none() => {
                    active.answered = Some(Instant::now());
                    active.timers.clone()
                }
                _ => return,
            }
        };

        let this = self.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timers.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if this.inner.engine.state() != CallState::Connected {
                    continue;
                }
                let Some(secs) = this.elapsed_secs(&call_id) else {
                    break;
                };
                this.notify(CallNotification::Duration {
                    call_id: call_id.clone(),
                    secs,
                });
            }
        });
    }

    fn elapsed_secs(&self, call_id: &str) -> Option<u64> {
        let state = self.inner.state.lock();
        let active = state.active.as_ref().filter(|a| a.call_id == call_id)?;
        active.answered.map(|t| t.elapsed().as_secs())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// ID des aktiven Anrufs, sofern `call_id` dazu passt
    ///
    /// Ohne `call_id` muss der Absender (falls angegeben) die Gegenstelle sein.
    fn current_call_id(&self, call_id: Option<&str>, from: Option<&str>) -> Option<String> {
        let state = self.inner.state.lock();
        let active = state.active.as_ref()?;
        match (call_id, from) {
            (Some(id), _) if id != active.call_id => None,
            (None, Some(from)) if from != active.remote.user_id => None,
            _ => Some(active.call_id.clone()),
        }
    }

    /// Entfernt den aktiven Anruf und stoppt dessen Timer
    fn take_active(&self, call_id: &str) -> Option<ActiveCall> {
        let active = {
            let mut state = self.inner.state.lock();
            state.held_candidates.retain(|(id, _)| id != call_id);
            match state.active.as_ref() {
                Some(active) if active.call_id == call_id => state.active.take(),
                _ => None,
            }
        };

        if let Some(active) = &active {
            active.timers.cancel();
        }
        active
    }

    fn finish(&self, session: CallSession, outcome: CallOutcome, failure: Option<String>) -> Option<CallRecord> {
        let active = self.take_active(&session.call_id);
        self.record(session, active.as_ref(), outcome, failure)
    }

    /// Schreibt den Verlaufseintrag und meldet das Ende, einmal pro Anruf
    fn record(
        &self,
        session: CallSession,
        active: Option<&ActiveCall>,
        outcome: CallOutcome,
        failure: Option<String>,
    ) -> Option<CallRecord> {
        let duration_secs = match active.and_then(|a| a.answered) {
            Some(answered) => answered.elapsed().as_secs(),
            None => session
                .answered_at
                .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
                .unwrap_or(0),
        };

        let outcome = match outcome {
            CallOutcome::Completed if session.answered_at.is_none() => CallOutcome::Missed,
            other => other,
        };

        let record = CallRecord::new(
            session.call_id,
            session.remote,
            session.direction,
            session.kind,
            outcome,
            duration_secs,
        );
        if !self.inner.log.append(record.clone()) {
            return None;
        }

        match failure {
            Some(reason) => self.notify(CallNotification::Failed {
                record: record.clone(),
                reason,
            }),
            None => self.notify(CallNotification::Ended(record.clone())),
        }
        Some(record)
    }

    fn send_signal<T: Serialize>(&self, action: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(data) => self.inner.signaling.send(action, data),
            Err(e) => tracing::error!("Failed to encode {}: {}", action, e),
        }
    }

    fn notify(&self, notification: CallNotification) {
        let _ = self.inner.notify_tx.send(notification);
    }
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CallCoordinator")
            .field("active_call", &state.active.as_ref().map(|a| a.call_id.as_str()))
            .field("attached", &state.attachment.is_some())
            .field("options", &self.inner.options)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
