use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Path of the upgrade endpoint
    pub ws_path: String,
    /// Header carrying the caller-supplied client identity
    pub identity_header: String,
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// How long shutdown waits for connections to drain
    pub shutdown_drain_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            ws_path: "/ws".to_string(),
            identity_header: "X-User-Id".to_string(),
            max_message_size: 64 * 1024,
            shutdown_drain_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Broker URL. Empty selects single-node mode (in-process broker).
    pub url: String,
    /// Pub/sub channel shared by every node of the fleet
    pub channel: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            channel: "messages".to_string(),
            connect_timeout_seconds: 5,
        }
    }
}

/// How a payload read on this node reaches this node's own clients
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Local peers receive a payload only once the broker echoes it back
    #[default]
    BrokerEcho,
    /// Payload is queued locally right away; the broker echo of our own
    /// frames is dropped
    LocalFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub fanout_queue_capacity: usize,
    pub publish_queue_capacity: usize,
    /// Per-connection write deadline during fan-out
    pub write_timeout_ms: u64,
    /// Outbound frames buffered per connection
    pub connection_buffer: usize,
    pub delivery_mode: DeliveryMode,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fanout_queue_capacity: 10_000,
            publish_queue_capacity: 10_000,
            write_timeout_ms: 5_000,
            connection_buffer: 256,
            delivery_mode: DeliveryMode::BrokerEcho,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    ///
    /// Environment keys look like `CARDSOCKET_RELAY__WRITE_TIMEOUT_MS`.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CARDSOCKET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if !self.server.ws_path.starts_with('/') {
            errors.push(format!(
                "server.ws_path must start with '/', got '{}'",
                self.server.ws_path
            ));
        }
        if self.server.identity_header.trim().is_empty() {
            errors.push("server.identity_header must not be empty".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be non-zero".to_string());
        }
        if !self.redis.url.is_empty() && self.redis.channel.is_empty() {
            errors.push("redis.channel must not be empty when redis.url is set".to_string());
        }
        if self.relay.fanout_queue_capacity == 0 {
            errors.push("relay.fanout_queue_capacity must be non-zero".to_string());
        }
        if self.relay.publish_queue_capacity == 0 {
            errors.push("relay.publish_queue_capacity must be non-zero".to_string());
        }
        if self.relay.connection_buffer == 0 {
            errors.push("relay.connection_buffer must be non-zero".to_string());
        }
        if self.relay.write_timeout_ms == 0 {
            errors.push("relay.write_timeout_ms must be non-zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Whether a broker URL is configured
    #[must_use]
    pub fn is_clustered(&self) -> bool {
        !self.redis.url.is_empty()
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}
