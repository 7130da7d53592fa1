//! Connection Manager für den Signaling-Server
//!
//! Verwaltet genau eine persistente Verbindung:
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Heartbeat während die Verbindung steht
//! - Warteschlange für Nachrichten ohne Verbindung
//! - Korrelierte Requests (`requestId`) mit Timeout
//! - Pub/Sub nach Event-Typ inkl. Wildcard

use super::messages::*;
use super::queue::OutboundQueue;
use super::transport::{ConnectTarget, Connector, Transport, WebSocketConnector};
use crate::config::{ConnectOptions, Credentials, DEFAULT_OUTBOUND_QUEUE_CAPACITY, MAX_RECONNECT_DELAY};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Request '{action}' timed out after {timeout:?}")]
    Timeout { action: String, timeout: Duration },

    #[error("Server error for '{action}': {message}")]
    ServerError { action: String, message: String },

    #[error("Connection lost before a response arrived")]
    ConnectionLost,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Benachrichtigungen über Zustandswechsel der Verbindung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Reconnect ist geplant: `attempt` beginnt bei 1
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnectionStatus {
    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Connecting => ConnectionState::Connecting,
            Self::Connected => ConnectionState::Connected,
            Self::Disconnected => ConnectionState::Disconnected,
            Self::Reconnecting { .. } => ConnectionState::Reconnecting,
        }
    }
}

/// Verzögerung vor dem `attempt`-ten Reconnect: `min(base * 2^(attempt-1), 30s)`
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .unwrap_or(MAX_RECONNECT_DELAY)
        .min(MAX_RECONNECT_DELAY)
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// Schlüssel für Event-Subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// Nachrichten mit diesem `type` bzw. `action`
    Type(String),
    /// Alle eingehenden Nachrichten
    Any,
}

impl From<&str> for EventKey {
    fn from(value: &str) -> Self {
        Self::Type(value.to_string())
    }
}

impl From<String> for EventKey {
    fn from(value: String) -> Self {
        Self::Type(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type EventHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

// ============================================================================
// SHARED STATE
// ============================================================================

/// Frame auf dem Weg zum Writer
struct Outgoing {
    frame: String,
    /// Bei Schreibfehler zurück in die Warteschlange?
    requeue: bool,
}

impl Outgoing {
    fn queued(frame: String) -> Self {
        Self {
            frame,
            requeue: true,
        }
    }

    fn transient(frame: String) -> Self {
        Self {
            frame,
            requeue: false,
        }
    }
}

struct Connection {
    state: ConnectionState,
    attempts: u32,
    last_connected_at: Option<DateTime<Utc>>,
    rooms: BTreeSet<String>,
    auto_reconnect: bool,
    /// Wird bei jedem connect/disconnect erhöht; alte Tasks erkennen so, dass sie veraltet sind
    generation: u64,
    writer: Option<mpsc::UnboundedSender<Outgoing>>,
    queue: OutboundQueue,
    cancel: Option<CancellationToken>,
}

struct PendingRequest {
    action: String,
    responder: oneshot::Sender<Result<Value, SignalingError>>,
    seq: u64,
}

struct Shared {
    conn: Mutex<Connection>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    handlers: RwLock<HashMap<EventKey, Vec<(SubscriptionId, EventHandler)>>>,
    next_id: AtomicU64,
    status_tx: broadcast::Sender<ConnectionStatus>,
}

impl Shared {
    fn notify(&self, status: ConnectionStatus) {
        tracing::debug!("Signaling status: {:?}", status);
        let _ = self.status_tx.send(status);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn handle_frame(&self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Ignoring unparseable frame: {}", e);
                return;
            }
        };

        if message.is_response() {
            self.resolve(&message);
        }
        self.dispatch(&message);
    }

    /// Ordnet eine Antwort dem passenden Request zu
    fn resolve(&self, message: &InboundMessage) {
        let pending = {
            let mut pending = self.pending.lock();
            let key = match &message.request_id {
                Some(id) => pending.contains_key(id).then(|| id.clone()),
                // Server ohne requestId-Echo: ältester Request mit derselben Action
                None => message.action.as_deref().and_then(|action| {
                    pending
                        .iter()
                        .filter(|(_, p)| p.action == action)
                        .min_by_key(|(_, p)| p.seq)
                        .map(|(id, _)| id.clone())
                }),
            };
            key.and_then(|key| pending.remove(&key))
        };

        let Some(pending) = pending else {
            return;
        };

        let result = match message.error_message() {
            Some(error) => Err(SignalingError::ServerError {
                action: pending.action.clone(),
                message: error,
            }),
            None => Ok(message.data.clone()),
        };
        let _ = pending.responder.send(result);
    }

    fn dispatch(&self, message: &InboundMessage) {
        let handlers: Vec<EventHandler> = {
            let handlers = self.handlers.read();
            let typed = message
                .event_type()
                .and_then(|t| handlers.get(&EventKey::Type(t.to_string())));
            typed
                .into_iter()
                .flatten()
                .chain(handlers.get(&EventKey::Any).into_iter().flatten())
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        for handler in handlers {
            handler(message);
        }
    }

    fn reject_all(&self, error: SignalingError) {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            tracing::debug!("Rejecting {} pending request(s): {}", drained.len(), error);
        }
        for pending in drained {
            let _ = pending.responder.send(Err(error.clone()));
        }
    }
}

/// Entfernt die Request-Buchhaltung auf jedem Exit-Pfad
struct PendingGuard<'a> {
    shared: &'a Shared,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.request_id);
    }
}

// ============================================================================
// CONNECTION TASK
// ============================================================================

enum SessionEnd {
    Closed,
    Cancelled,
}

/// Hintergrund-Task für eine `connect()`-Generation
struct ConnectionTask {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    target: ConnectTarget,
    options: ConnectOptions,
    generation: u64,
    cancel: CancellationToken,
}

impl ConnectionTask {
    async fn run(self) {
        loop {
            if !self.enter_connecting() {
                return;
            }

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = time::timeout(self.options.handshake_timeout, self.connector.open(&self.target)) => result,
            };

            match opened {
                Ok(Ok(transport)) => {
                    if let SessionEnd::Cancelled = self.serve(transport).await {
                        return;
                    }
                }
                Ok(Err(e)) => tracing::warn!("Signaling handshake failed: {}", e),
                Err(_) => tracing::warn!(
                    "Signaling handshake timed out after {:?}",
                    self.options.handshake_timeout
                ),
            }

            let Some(delay) = self.after_close() else {
                return;
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
        }
    }

    fn enter_connecting(&self) -> bool {
        let changed = {
            let mut conn = self.shared.conn.lock();
            if conn.generation != self.generation {
                return false;
            }
            let changed = conn.state != ConnectionState::Connecting;
            conn.state = ConnectionState::Connecting;
            changed
        };

        if changed {
            self.shared.notify(ConnectionStatus::Connecting);
        }
        true
    }

    /// Betreibt eine offene Verbindung bis sie endet
    async fn serve(&self, mut transport: Box<dyn Transport>) -> SessionEnd {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();

        let flushed = {
            let mut conn = self.shared.conn.lock();
            if conn.generation != self.generation {
                None
            } else {
                conn.attempts = 0;
                conn.last_connected_at = Some(Utc::now());
                conn.state = ConnectionState::Connected;

                for room in &conn.rooms {
                    if let Ok(frame) = OutboundMessage::join_room(room).to_frame() {
                        let _ = tx.send(Outgoing::transient(frame));
                    }
                }

                let backlog: Vec<String> = conn.queue.drain().collect();
                let flushed = backlog.len();
                for frame in backlog {
                    let _ = tx.send(Outgoing::queued(frame));
                }

                conn.writer = Some(tx);
                Some(flushed)
            }
        };

        let Some(flushed) = flushed else {
            transport.close().await;
            return SessionEnd::Cancelled;
        };

        tracing::info!("Connected to signaling server ({} queued message(s) flushed)", flushed);
        self.shared.notify(ConnectionStatus::Connected);

        let period = self.options.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut unsent: Vec<Outgoing> = Vec::new();
        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SessionEnd::Cancelled,

                Some(outgoing) = rx.recv() => {
                    if let Err(e) = transport.send_text(outgoing.frame.clone()).await {
                        tracing::warn!("Signaling send failed: {}", e);
                        unsent.push(outgoing);
                        break SessionEnd::Closed;
                    }
                }

                incoming = transport.recv_text() => match incoming {
                    Ok(Some(text)) => self.shared.handle_frame(&text),
                    Ok(None) => {
                        tracing::info!("Signaling connection closed by server");
                        break SessionEnd::Closed;
                    }
                    Err(e) => {
                        tracing::warn!("Signaling connection error: {}", e);
                        break SessionEnd::Closed;
                    }
                },

                _ = heartbeat.tick() => {
                    if let Ok(frame) = OutboundMessage::ping().to_frame() {
                        if let Err(e) = transport.send_text(frame).await {
                            tracing::warn!("Heartbeat failed: {}", e);
                            break SessionEnd::Closed;
                        }
                    }
                }
            }
        };

        // Writer abhängen und nicht zugestellte Frames vorne wieder einreihen
        let requeued = {
            let mut conn = self.shared.conn.lock();
            if conn.generation == self.generation {
                conn.writer = None;
            }
            rx.close();
            while let Ok(outgoing) = rx.try_recv() {
                unsent.push(outgoing);
            }
            let frames: Vec<String> = unsent
                .into_iter()
                .filter(|o| o.requeue)
                .map(|o| o.frame)
                .collect();
            let requeued = frames.len();
            conn.queue.requeue_front(frames);
            requeued
        };
        if requeued > 0 {
            tracing::debug!("Re-queued {} unsent frame(s)", requeued);
        }

        transport.close().await;

        if let SessionEnd::Closed = end {
            self.shared.reject_all(SignalingError::ConnectionLost);
        }
        end
    }

    /// Entscheidet nach einem Verbindungsende über den nächsten Versuch
    fn after_close(&self) -> Option<Duration> {
        let reconnect = {
            let mut conn = self.shared.conn.lock();
            if conn.generation != self.generation {
                return None;
            }
            conn.writer = None;
            conn.state = ConnectionState::Disconnected;

            if !conn.auto_reconnect {
                None
            } else if conn.attempts >= self.options.max_reconnect_attempts {
                tracing::error!(
                    "Giving up on signaling server after {} reconnect attempt(s)",
                    conn.attempts
                );
                conn.auto_reconnect = false;
                conn.cancel = None;
                None
            } else {
                conn.attempts += 1;
                conn.state = ConnectionState::Reconnecting;
                let delay = reconnect_delay(self.options.reconnect_interval, conn.attempts);
                Some((conn.attempts, delay))
            }
        };

        self.shared.notify(ConnectionStatus::Disconnected);

        let (attempt, delay) = reconnect?;
        tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        self.shared
            .notify(ConnectionStatus::Reconnecting { attempt, delay });
        Some(delay)
    }
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

/// Persistente Verbindung zum Signaling-Server
///
/// Günstig zu klonen; alle Klone teilen dieselbe Verbindung.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (status_tx, _) = broadcast::channel(64);

        Self {
            connector,
            shared: Arc::new(Shared {
                conn: Mutex::new(Connection {
                    state: ConnectionState::Disconnected,
                    attempts: 0,
                    last_connected_at: None,
                    rooms: BTreeSet::new(),
                    auto_reconnect: false,
                    generation: 0,
                    writer: None,
                    queue: OutboundQueue::new(DEFAULT_OUTBOUND_QUEUE_CAPACITY),
                    cancel: None,
                }),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                status_tx,
            }),
        }
    }

    /// Manager mit WebSocket-Transport
    pub fn websocket() -> Self {
        Self::new(Arc::new(WebSocketConnector))
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.conn.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.conn.lock().attempts
    }

    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        self.shared.conn.lock().last_connected_at
    }

    pub fn rooms(&self) -> Vec<String> {
        self.shared.conn.lock().rooms.iter().cloned().collect()
    }

    /// Anzahl der Frames, die auf eine Verbindung warten
    pub fn queued_len(&self) -> usize {
        self.shared.conn.lock().queue.len()
    }

    pub fn pending_request_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Startet den Verbindungsaufbau im Hintergrund
    ///
    /// Fehler werden nicht zurückgegeben, sondern über
    /// [`ConnectionStatus::Disconnected`] gemeldet.
    pub fn connect(&self, endpoint: &str, credentials: Credentials, options: ConnectOptions) {
        let endpoint = match Url::parse(endpoint) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!("Invalid signaling endpoint {:?}: {}", endpoint, e);
                self.shared.conn.lock().state = ConnectionState::Disconnected;
                self.shared.notify(ConnectionStatus::Disconnected);
                return;
            }
        };

        let cancel = CancellationToken::new();
        let (generation, previous) = {
            let mut conn = self.shared.conn.lock();
            let previous = conn.cancel.replace(cancel.clone());
            conn.generation += 1;
            conn.auto_reconnect = options.auto_reconnect;
            conn.attempts = 0;
            conn.writer = None;
            conn.state = ConnectionState::Connecting;
            conn.queue.set_capacity(options.outbound_queue_capacity);
            (conn.generation, previous)
        };

        if let Some(previous) = previous {
            previous.cancel();
        }
        self.shared.notify(ConnectionStatus::Connecting);

        let task = ConnectionTask {
            shared: Arc::clone(&self.shared),
            connector: Arc::clone(&self.connector),
            target: ConnectTarget {
                endpoint,
                credentials,
                platform: options.client_platform.clone(),
            },
            options,
            generation,
            cancel,
        };
        tokio::spawn(task.run());
    }

    /// Trennt die Verbindung und stoppt alle Timer (idempotent)
    pub fn disconnect(&self) {
        let (previous, cancel) = {
            let mut conn = self.shared.conn.lock();
            conn.generation += 1;
            conn.auto_reconnect = false;
            conn.attempts = 0;
            conn.writer = None;
            let previous = std::mem::replace(&mut conn.state, ConnectionState::Disconnected);
            (previous, conn.cancel.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.shared.reject_all(SignalingError::Cancelled);

        if previous != ConnectionState::Disconnected {
            tracing::info!("Disconnected from signaling server");
            self.shared.notify(ConnectionStatus::Disconnected);
        }
    }

    /// Fire-and-forget; ohne Verbindung landet die Nachricht in der Warteschlange
    pub fn send(&self, action: &str, data: Value) {
        self.send_message(&OutboundMessage::new(action, data));
    }

    pub fn send_message(&self, message: &OutboundMessage) {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode '{}': {}", message.action, e);
                return;
            }
        };

        let mut conn = self.shared.conn.lock();
        let frame = match conn.writer.as_ref() {
            Some(writer) => match writer.send(Outgoing::queued(frame)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(outgoing)) => outgoing.frame,
            },
            None => frame,
        };

        tracing::debug!("Not connected, queueing '{}'", message.action);
        conn.queue.push(frame);
    }

    /// Korrelierter Request; wird niemals automatisch wiederholt
    pub async fn request(
        &self,
        action: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, SignalingError> {
        let request_id = Uuid::new_v4().to_string();
        let frame = OutboundMessage::request(action, data, request_id.clone())
            .to_frame()
            .map_err(|e| SignalingError::Encode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let conn = self.shared.conn.lock();
            let writer = match (conn.state, conn.writer.as_ref()) {
                (ConnectionState::Connected, Some(writer)) => writer,
                _ => return Err(SignalingError::NotConnected),
            };

            self.shared.pending.lock().insert(
                request_id.clone(),
                PendingRequest {
                    action: action.to_string(),
                    responder: tx,
                    seq: self.shared.next_id(),
                },
            );

            if writer.send(Outgoing::transient(frame)).is_err() {
                self.shared.pending.lock().remove(&request_id);
                return Err(SignalingError::NotConnected);
            }
        }

        let _guard = PendingGuard {
            shared: &self.shared,
            request_id,
        };

        match time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalingError::Cancelled),
            Err(_) => {
                tracing::warn!("Request '{}' timed out after {:?}", action, timeout);
                Err(SignalingError::Timeout {
                    action: action.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Registriert einen Handler für einen Event-Typ oder [`EventKey::Any`]
    pub fn on<F>(&self, key: impl Into<EventKey>, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_id());
        self.shared
            .handlers
            .write()
            .entry(key.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, key: &EventKey, id: SubscriptionId) -> bool {
        let mut handlers = self.shared.handlers.write();
        let Some(list) = handlers.get_mut(key) else {
            return false;
        };

        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(key);
        }
        removed
    }

    /// Subscription als Channel, in Ankunftsreihenfolge
    pub fn events(
        &self,
        key: impl Into<EventKey>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(key, move |message| {
            let _ = tx.send(message.clone());
        });
        (id, rx)
    }

    /// Tritt einem Raum bei; nach jedem Reconnect automatisch erneut
    pub fn join_room(&self, room: &str) {
        let inserted = self.shared.conn.lock().rooms.insert(room.to_string());
        if inserted {
            self.send_live(OutboundMessage::join_room(room));
        }
    }

    pub fn leave_room(&self, room: &str) {
        let removed = self.shared.conn.lock().rooms.remove(room);
        if removed {
            self.send_live(OutboundMessage::leave_room(room));
        }
    }

    /// Sendet nur bei bestehender Verbindung, ohne Warteschlange
    fn send_live(&self, message: OutboundMessage) {
        let Ok(frame) = message.to_frame() else {
            return;
        };
        if let Some(writer) = self.shared.conn.lock().writer.as_ref() {
            let _ = writer.send(Outgoing::transient(frame));
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let conn = self.shared.conn.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &conn.state)
            .field("attempts", &conn.attempts)
            .field("queued", &conn.queue.len())
            .field("rooms", &conn.rooms)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
