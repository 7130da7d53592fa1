//! Signaling-Probe
//!
//! Verbindet sich mit der Konfiguration aus der Umgebung, tritt den als
//! Argumente übergebenen Räumen bei und loggt Verbindungsstatus, eingehende
//! Events und Anruf-Benachrichtigungen bis Ctrl-C.

use anyhow::{Context, Result};
use shopfloor_rtc::{ClientConfig, EventKey, RtcClient};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    shopfloor_rtc::init_tracing();

    let config = ClientConfig::from_env().context("Invalid signaling configuration")?;
    if config.credentials.is_empty() {
        tracing::warn!("SIGNALING_TOKEN is not set, connecting without credentials");
    }

    let client = RtcClient::with_defaults(config);
    let mut status = client.signaling().subscribe_status();
    let mut notifications = client.calls().subscribe();
    let (_, mut events) = client.signaling().events(EventKey::Any);

    for room in std::env::args().skip(1) {
        client.signaling().join_room(&room);
    }
    client.start();

    loop {
        tokio::select! {
            result = status.recv() => match result {
                Ok(status) => tracing::info!("Connection: {:?}", status),
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} status update(s)", n),
                Err(RecvError::Closed) => break,
            },
            Some(event) = events.recv() => {
                tracing::info!(
                    "Event {}: {}",
                    event.event_type().unwrap_or("<untyped>"),
                    event.data
                );
            }
            result = notifications.recv() => match result {
                Ok(notification) => tracing::info!("Call: {:?}", notification),
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} call notification(s)", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
