//! Signaling Module - persistente Verbindung zum Realtime-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - WebSocket-Verbindung aufbauen, halten und bei Abbruch wiederherstellen
//! - Fire-and-forget Nachrichten und korrelierte Requests
//! - Eingehende Nachrichten parsen und an Subscriber verteilen
//!

mod client;
mod messages;
mod queue;
mod transport;

pub use client::{
    reconnect_delay, ConnectionManager, ConnectionState, ConnectionStatus, EventHandler,
    EventKey, SignalingError, SubscriptionId,
};
pub use messages::*;
pub use queue::OutboundQueue;
pub use transport::{ConnectTarget, Connector, Transport, TransportError, WebSocketConnector, WebSocketTransport};
