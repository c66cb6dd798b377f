//! Server configuration.
//!
//! Configuration is layered from:
//! - The first TOML file found in the default locations
//! - Environment variables (`PARLEY__PORT`, `PARLEY__LIMITS__MAX_CONNECTIONS`, ...)
//!
//! Setting `PARLEY_CONFIG` to a file path reads that file alone instead.

use anyhow::{Context, Result};
use parley_core::{
    Exchange, ExchangeStatus, MemoryExchangeService, MemoryMessageStore, MemoryUserDirectory,
    MessageCipher, RelayConfig, RoomConfig, UserProfile,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Locations searched for a configuration file, in order.
const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Chat message rules.
    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub calls: CallsConfig,

    /// Message encryption settings.
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Users and exchanges preloaded into the in-memory services.
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum rooms a single connection may join.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Silence after which a connection is dropped, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Maximum characters per message, after trimming.
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    /// Messages returned by a history request without a limit.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Largest history request honored.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// How long a call rings before it is ended, in milliseconds.
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Base64-encoded 32-byte AES key for stored messages.
    #[serde(default)]
    pub message_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub users: Vec<UserProfile>,

    #[serde(default)]
    pub exchanges: Vec<SeedExchange>,
}

/// An exchange as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedExchange {
    pub id: u64,
    pub requester_id: u64,
    pub provider_id: u64,
    #[serde(default = "default_exchange_status")]
    pub status: ExchangeStatus,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_max_rooms() -> usize {
    100
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_message_chars() -> usize {
    1000
}

fn default_history_limit() -> usize {
    50
}

fn default_max_history() -> usize {
    200
}

fn default_ring_timeout() -> u64 {
    30_000
}

fn default_exchange_status() -> ExchangeStatus {
    ExchangeStatus::Accepted
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            chat: ChatConfig::default(),
            calls: CallsConfig::default(),
            crypto: CryptoConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            max_rooms_per_connection: default_max_rooms(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
            history_limit: default_history_limit(),
            max_history: default_max_history(),
        }
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            ring_timeout_ms: default_ring_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from the default locations and the environment.
    ///
    /// An explicit `PARLEY_CONFIG` path skips both.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("PARLEY_CONFIG") {
            return Self::from_file(shellexpand::tilde(&path).as_ref());
        }

        let mut builder = ::config::Config::builder();

        if let Some(path) = CONFIG_PATHS
            .iter()
            .map(|p| shellexpand::tilde(p).into_owned())
            .find(|p| Path::new(p).exists())
        {
            info!("Loading configuration from {}", path);
            builder = builder.add_source(
                ::config::File::with_name(&path).format(::config::FileFormat::Toml),
            );
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("PARLEY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Relay settings derived from this configuration.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_message_chars: self.chat.max_message_chars,
            history_limit: self.chat.history_limit,
            max_history: self.chat.max_history,
            max_rooms_per_connection: self.limits.max_rooms_per_connection,
            room: RoomConfig {
                ring_timeout: Duration::from_millis(self.calls.ring_timeout_ms),
                ..RoomConfig::default()
            },
        }
    }

    /// Build the message cipher.
    ///
    /// Without a configured key a random one is generated; messages stored
    /// under it cannot be read after a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured key is not base64 or not 32 bytes.
    pub fn cipher(&self) -> Result<MessageCipher> {
        match &self.crypto.message_key {
            Some(key) => MessageCipher::from_base64(key).context("Invalid crypto.message_key"),
            None => {
                warn!("No crypto.message_key configured, using an ephemeral key");
                Ok(MessageCipher::generate())
            }
        }
    }
}

impl SeedConfig {
    /// In-memory services preloaded with the seed data.
    #[must_use]
    pub fn services(
        &self,
    ) -> (
        Arc<MemoryExchangeService>,
        Arc<MemoryUserDirectory>,
        Arc<MemoryMessageStore>,
    ) {
        let exchanges = Arc::new(MemoryExchangeService::new());
        for seed in &self.exchanges {
            exchanges.insert(Exchange {
                id: seed.id,
                requester_id: seed.requester_id,
                provider_id: seed.provider_id,
                status: seed.status,
            });
        }

        let users = Arc::new(MemoryUserDirectory::new());
        for user in &self.users {
            users.insert(user.clone());
        }

        info!(
            users = self.users.len(),
            exchanges = self.exchanges.len(),
            "Seeded in-memory services"
        );
        (exchanges, users, Arc::new(MemoryMessageStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.chat.max_message_chars, 1000);
        assert!(config.crypto.message_key.is_none());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [calls]
            ring_timeout_ms = 5000

            [[seed.users]]
            id = 1
            name = "Alice"

            [[seed.exchanges]]
            id = 42
            requester_id = 1
            provider_id = 2
            status = "inProgress"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.max_rooms_per_connection, 100);
        assert_eq!(
            config.relay_config().room.ring_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(config.seed.users[0].name, "Alice");
        assert_eq!(config.seed.exchanges[0].status, ExchangeStatus::InProgress);
    }

    #[tokio::test]
    async fn test_seeded_services() {
        use parley_core::{ExchangeService, UserDirectory};

        let config: Config = toml::from_str(
            r#"
            [[seed.users]]
            id = 2
            name = "Bob"

            [[seed.exchanges]]
            id = 42
            requester_id = 1
            provider_id = 2
            "#,
        )
        .unwrap();

        let (exchanges, users, _store) = config.seed.services();
        let exchange = exchanges.get(42).await.unwrap().unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Accepted);
        assert!(exchange.is_participant(2));
        assert_eq!(users.resolve(2).await.unwrap().unwrap().name, "Bob");
    }

    #[test]
    fn test_cipher_key() {
        let mut config = Config::default();
        assert!(config.cipher().is_ok());

        config.crypto.message_key = Some("AAAA".to_string());
        assert!(config.cipher().is_err());

        // 32 zero bytes.
        config.crypto.message_key =
            Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string());
        assert!(config.cipher().is_ok());
    }
}
