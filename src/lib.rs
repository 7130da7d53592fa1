//! shopfloor-rtc - Echtzeit-Schicht für das Shop-Floor-Dashboard
//!
//! - WebSocket-Signaling mit Reconnect, Warteschlange und Request/Response
//! - WebRTC Audio/Video-Anrufe zwischen Stationen
//! - SQLite für den Anrufverlauf

pub mod call_engine;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod signaling;

pub use call_engine::{
    CallDirection, CallEngine, CallError, CallEvent, CallSession, CallState, MediaDevices,
    MediaError, MediaKind, PeerFactory, RemoteParty, WebRtcPeerFactory,
};
pub use config::{CallOptions, ClientConfig, ConfigError, ConnectOptions, Credentials, TurnServer};
pub use coordinator::{CallCoordinator, CallNotification};
pub use database::{CallHistoryStore, CallLog, CallOutcome, CallRecord, DatabaseError, SqliteCallHistory};
pub use signaling::{ConnectionManager, ConnectionState, ConnectionStatus, EventKey, SignalingError};

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_DIRECTIVES: &str = "shopfloor_rtc=debug,webrtc=warn";

/// Initialisiert das Logging; mehrfacher Aufruf ist harmlos
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CLIENT
// ============================================================================

/// Verdrahtet Signaling, Call Engine, Anrufverlauf und Coordinator
pub struct RtcClient {
    config: ClientConfig,
    coordinator: CallCoordinator,
}

impl RtcClient {
    pub fn new(
        config: ClientConfig,
        signaling: ConnectionManager,
        engine: Arc<CallEngine>,
        log: Arc<CallLog>,
    ) -> Self {
        let coordinator = CallCoordinator::new(signaling, engine, log, config.call.clone());
        Self { config, coordinator }
    }

    /// WebSocket, webrtc (inkl. TURN aus der Konfiguration) und SQLite-Verlauf
    ///
    /// Ist die Datenbank nicht verfügbar, wird der Verlauf nur im Speicher
    /// gehalten.
    pub fn with_defaults(config: ClientConfig) -> Self {
        #[cfg(feature = "audio")]
        let devices: Arc<dyn MediaDevices> = Arc::new(call_engine::SystemMediaDevices::new());
        #[cfg(not(feature = "audio"))]
        let devices: Arc<dyn MediaDevices> = Arc::new(call_engine::RtpMediaDevices::new());

        let mut peers = WebRtcPeerFactory::default();
        if let Some(turn) = &config.call.turn {
            tracing::info!("Using TURN relay {}", turn.url);
            peers = peers.with_turn_server(&turn.url, &turn.username, &turn.credential);
        }

        let engine = Arc::new(CallEngine::new(devices, Arc::new(peers)));
        let log = Arc::new(Self::open_history(config.call.history_limit));

        Self::new(config, ConnectionManager::websocket(), engine, log)
    }

    fn open_history(limit: usize) -> CallLog {
        let loaded = SqliteCallHistory::open(limit)
            .and_then(|db| CallLog::load(Arc::new(db), limit));

        match loaded {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!("Call history unavailable, keeping it in memory: {}", e);
                CallLog::new(limit)
            }
        }
    }

    /// Startet die Anrufverarbeitung und verbindet
    pub fn start(&self) {
        tracing::info!("Connecting to {}", self.config.endpoint);

        self.coordinator.attach();
        self.signaling().connect(
            &self.config.endpoint,
            self.config.credentials.clone(),
            self.config.connect.clone(),
        );
    }

    /// Legt auf, beendet die Verarbeitung und trennt die Verbindung
    pub async fn shutdown(&self) {
        if let Some(record) = self.coordinator.hang_up().await {
            tracing::info!("Hung up call {} on shutdown", record.call_id);
        }
        self.coordinator.detach();
        self.signaling().disconnect();
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn signaling(&self) -> &ConnectionManager {
        self.coordinator.signaling()
    }

    pub fn calls(&self) -> &CallCoordinator {
        &self.coordinator
    }

    pub fn engine(&self) -> &Arc<CallEngine> {
        self.coordinator.engine()
    }
}

impl std::fmt::Debug for RtcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcClient")
            .field("endpoint", &self.config.endpoint)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
