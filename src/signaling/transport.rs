//! Transport-Abstraktion für den Signaling-Kanal
//!
//! [`Connector`] baut eine Verbindung auf, [`Transport`] ist die offene
//! Verbindung. Die Standard-Implementierung nutzt `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::config::Credentials;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Failed to receive frame: {0}")]
    ReceiveFailed(String),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Ziel einer Verbindung
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub endpoint: Url,
    pub credentials: Credentials,
    pub platform: String,
}

impl ConnectTarget {
    /// URL inklusive `token`- und `platform`-Query-Parametern
    pub fn url(&self) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            if !self.credentials.is_empty() {
                query.append_pair("token", self.credentials.token());
            }
            query.append_pair("platform", &self.platform);
        }
        url
    }
}

/// Eine offene, bidirektionale Text-Verbindung
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Nächster Text-Frame; `Ok(None)` wenn die Gegenseite geschlossen hat
    async fn recv_text(&mut self) -> Result<Option<String>, TransportError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, TransportError>;
}

// ============================================================================
// WEBSOCKET IMPLEMENTATION
// ============================================================================

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Verbindet per WebSocket
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, TransportError> {
        tracing::info!(
            "Connecting to signaling server: {} (platform={})",
            target.endpoint,
            target.platform
        );

        let (stream, response) = connect_async(target.url().as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Box::new(WebSocketTransport { stream }))
    }
}

pub struct WebSocketTransport {
    stream: WsStream,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        tracing::trace!("WS send: {}", text);
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::trace!("WS recv: {}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed by server: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url_carries_token_and_platform() {
        let target = ConnectTarget {
            endpoint: Url::parse("wss://plant.example/realtime").unwrap(),
            credentials: Credentials::bearer("abc"),
            platform: "desktop".to_string(),
        };
        assert_eq!(
            target.url().as_str(),
            "wss://plant.example/realtime?token=abc&platform=desktop"
        );

        let anonymous = ConnectTarget {
            credentials: Credentials::default(),
            ..target
        };
        assert_eq!(
            anonymous.url().as_str(),
            "wss://plant.example/realtime?platform=desktop"
        );
    }
}
