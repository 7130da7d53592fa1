//! Konfiguration für Signaling-Verbindung und Anrufe
//!
//! Alle Werte haben sinnvolle Defaults und können über Umgebungsvariablen
//! überschrieben werden (siehe [`ClientConfig::from_env`]).

use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Standard Signaling-Endpoint (kann über `SIGNALING_URL` überschrieben werden)
pub const DEFAULT_SIGNALING_URL: &str = "wss://shopfloor.local/realtime";

/// Basis-Intervall für Reconnect-Versuche
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(1000);

/// Obergrenze für die Backoff-Verzögerung
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_CALL_HISTORY_LIMIT: usize = 50;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

// ============================================================================
// CREDENTIALS
// ============================================================================

/// Bearer-Token für den Signaling-Server
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

// Token niemals ins Log schreiben
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &if self.token.is_empty() { "<none>" } else { "<redacted>" })
            .finish()
    }
}

// ============================================================================
// CONNECT OPTIONS
// ============================================================================

/// Optionen für [`crate::signaling::ConnectionManager::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub auto_reconnect: bool,
    /// Basis für den exponentiellen Backoff
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    /// Plattform-Tag, wird beim Verbindungsaufbau mitgeschickt
    pub client_platform: String,
    pub handshake_timeout: Duration,
    pub outbound_queue_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            client_platform: "desktop".to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

// ============================================================================
// CALL OPTIONS
// ============================================================================

/// TURN-Relay für Netze, in denen STUN allein nicht reicht
#[derive(Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl fmt::Debug for TurnServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnServer")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOptions {
    /// Nach dieser Zeit gilt ein unbeantworteter Anruf als verpasst
    pub ring_timeout: Duration,
    pub history_limit: usize,
    pub turn: Option<TurnServer>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            ring_timeout: DEFAULT_RING_TIMEOUT,
            history_limit: DEFAULT_CALL_HISTORY_LIMIT,
            turn: None,
        }
    }
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

/// Gesamte Client-Konfiguration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub endpoint: String,
    pub credentials: Credentials,
    pub connect: ConnectOptions,
    pub call: CallOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SIGNALING_URL.to_string(),
            credentials: Credentials::default(),
            connect: ConnectOptions::default(),
            call: CallOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Liest die Konfiguration aus den Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Wie [`Self::from_env`], aber mit beliebiger Quelle (für Tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.endpoint = url;
        }
        if let Some(token) = lookup("SIGNALING_TOKEN") {
            config.credentials = Credentials::bearer(token);
        }
        if let Some(platform) = lookup("SIGNALING_PLATFORM") {
            config.connect.client_platform = platform;
        }
        if let Some(value) = lookup("SIGNALING_AUTO_RECONNECT") {
            config.connect.auto_reconnect = parse_bool("SIGNALING_AUTO_RECONNECT", &value)?;
        }
        if let Some(value) = lookup("SIGNALING_RECONNECT_INTERVAL_MS") {
            config.connect.reconnect_interval =
                Duration::from_millis(parse_num("SIGNALING_RECONNECT_INTERVAL_MS", &value)?);
        }
        if let Some(value) = lookup("SIGNALING_MAX_RECONNECT_ATTEMPTS") {
            config.connect.max_reconnect_attempts =
                parse_num("SIGNALING_MAX_RECONNECT_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("SIGNALING_HEARTBEAT_INTERVAL_MS") {
            let ms: u64 = parse_num("SIGNALING_HEARTBEAT_INTERVAL_MS", &value)?;
            if ms == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "SIGNALING_HEARTBEAT_INTERVAL_MS",
                    value,
                });
            }
            config.connect.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(value) = lookup("CALL_RING_TIMEOUT_SECS") {
            config.call.ring_timeout =
                Duration::from_secs(parse_num("CALL_RING_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = lookup("CALL_HISTORY_LIMIT") {
            config.call.history_limit = parse_num("CALL_HISTORY_LIMIT", &value)?;
        }
        if let Some(url) = lookup("TURN_URL") {
            config.call.turn = Some(TurnServer {
                url,
                username: lookup("TURN_USERNAME").unwrap_or_default(),
                credential: lookup("TURN_CREDENTIAL").unwrap_or_default(),
            });
        }

        Ok(config)
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = ClientConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert!(config.connect.auto_reconnect);
        assert_eq!(config.connect.max_reconnect_attempts, 10);
        assert_eq!(config.connect.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_from_env() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("SIGNALING_URL", "wss://plant-7.example/ws"),
            ("SIGNALING_TOKEN", "secret"),
            ("SIGNALING_AUTO_RECONNECT", "off"),
            ("SIGNALING_RECONNECT_INTERVAL_MS", "5000"),
            ("SIGNALING_MAX_RECONNECT_ATTEMPTS", "3"),
            ("CALL_HISTORY_LIMIT", "20"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint, "wss://plant-7.example/ws");
        assert_eq!(config.credentials.token(), "secret");
        assert!(!config.connect.auto_reconnect);
        assert_eq!(config.connect.reconnect_interval, Duration::from_millis(5000));
        assert_eq!(config.connect.max_reconnect_attempts, 3);
        assert_eq!(config.call.history_limit, 20);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[("SIGNALING_MAX_RECONNECT_ATTEMPTS", "many")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "SIGNALING_MAX_RECONNECT_ATTEMPTS",
                value: "many".to_string()
            }
        );

        assert!(ClientConfig::from_lookup(lookup(&[("SIGNALING_HEARTBEAT_INTERVAL_MS", "0")])).is_err());
        assert!(ClientConfig::from_lookup(lookup(&[("SIGNALING_AUTO_RECONNECT", "maybe")])).is_err());
    }

    #[test]
    fn test_credentials_are_redacted_in_debug() {
        let creds = Credentials::bearer("top-secret");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("top-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_turn_server_from_env() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("TURN_URL", "turn:relay.plant-7.example:3478"),
            ("TURN_USERNAME", "station"),
            ("TURN_CREDENTIAL", "hunter2"),
        ]))
        .unwrap();

        let turn = config.call.turn.as_ref().unwrap();
        assert_eq!(turn.url, "turn:relay.plant-7.example:3478");
        assert_eq!(turn.username, "station");
        assert!(!format!("{:?}", turn).contains("hunter2"));

        let without = ClientConfig::from_lookup(lookup(&[("TURN_USERNAME", "station")])).unwrap();
        assert_eq!(without.call.turn, None);
    }
}
