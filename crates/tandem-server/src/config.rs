//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML file (`$TANDEM_CONFIG`, `tandem.toml`, `/etc/tandem/tandem.toml`,
//!   `~/.config/tandem/tandem.toml`; first one found wins)
//! - Environment variables (`TANDEM__LIMITS__MAX_CONNECTIONS=5000`)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tandem_core::{HubConfig, RegistryConfig, TypingConfig};
use tandem_protocol::Encoding;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Live-channel transport.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Typing indicator windows.
    #[serde(default)]
    pub typing: TypingWindowConfig,

    /// Token verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Conversation store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Cross-origin policy for the HTTP surface.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Encoding used when the client does not pass `?encoding=`.
    #[serde(default = "default_encoding")]
    pub default_encoding: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum conversation rooms a connection may join.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,

    /// Maximum message text length in characters.
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,

    /// Frames buffered per connection before events are dropped.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds, advertised to clients.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Typing indicator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingWindowConfig {
    /// Server-side safety timeout in milliseconds.
    #[serde(default = "default_typing_timeout")]
    pub timeout_ms: u64,

    /// Floor for client-declared inactivity windows, in milliseconds.
    #[serde(default = "default_typing_min_window")]
    pub min_window_ms: u64,
}

/// Token verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 shared secret.
    #[serde(default)]
    pub jwt_secret: String,

    /// Allowed clock skew in seconds.
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `memory` or a `sqlite://` URL.
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Pool size for SQL stores.
    #[serde(default = "default_store_connections")]
    pub max_connections: u32,
}

/// CORS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. Empty or `*` allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
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

// Default value functions
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

fn default_encoding() -> String {
    "msgpack".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_rooms() -> usize {
    256
}

fn default_max_message_len() -> usize {
    tandem_core::pipeline::DEFAULT_MAX_MESSAGE_LEN
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_typing_timeout() -> u64 {
    60_000
}

fn default_typing_min_window() -> u64 {
    500
}

fn default_leeway() -> u64 {
    30
}

fn default_store_url() -> String {
    "memory".to_string()
}

fn default_store_connections() -> u32 {
    5
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            typing: TypingWindowConfig::default(),
            auth: AuthConfig::default(),
            store: StoreConfig::default(),
            cors: CorsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            default_encoding: default_encoding(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_rooms_per_connection: default_max_rooms(),
            max_message_len: default_max_message_len(),
            outbox_capacity: default_outbox_capacity(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for TypingWindowConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_typing_timeout(),
            min_window_ms: default_typing_min_window(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            leeway_secs: default_leeway(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_connections: default_store_connections(),
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

impl Config {
    /// Load configuration from the first config file found, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or the
    /// result fails validation.
    pub fn load() -> Result<Self> {
        let config = Self::layered(Self::find_file())?;
        config.validate()?;
        Ok(config)
    }

    fn find_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("TANDEM_CONFIG") {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        let config_paths = [
            "tandem.toml",
            "/etc/tandem/tandem.toml",
            "~/.config/tandem/tandem.toml",
        ];
        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    fn layered(file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(
                config::File::from(path.as_path()).format(config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TANDEM")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("cors.allowed_origins")
                .try_parsing(true),
        );

        let source = file
            .as_ref()
            .map_or_else(|| "environment".to_string(), |p| p.display().to_string());
        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .with_context(|| format!("Failed to load configuration from {source}"))
    }

    /// Reject configurations the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.trim().is_empty() {
            bail!("auth.jwt_secret must be set (TANDEM__AUTH__JWT_SECRET)");
        }
        if self.typing.min_window_ms > self.typing.timeout_ms {
            bail!(
                "typing.min_window_ms ({}) exceeds typing.timeout_ms ({})",
                self.typing.min_window_ms,
                self.typing.timeout_ms
            );
        }
        if self.limits.outbox_capacity == 0 {
            bail!("limits.outbox_capacity must be at least 1");
        }
        self.encoding()?;
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// The default live-channel encoding.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown encoding name.
    pub fn encoding(&self) -> Result<Encoding> {
        Encoding::parse(&self.transport.default_encoding).with_context(|| {
            format!(
                "Unknown transport.default_encoding: {}",
                self.transport.default_encoding
            )
        })
    }

    /// Chat hub settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            registry: RegistryConfig {
                max_connections: self.limits.max_connections,
                max_rooms_per_connection: self.limits.max_rooms_per_connection,
            },
            typing: TypingConfig {
                timeout: Duration::from_millis(self.typing.timeout_ms),
                min_window: Duration::from_millis(self.typing.min_window_ms),
            },
            max_message_len: self.limits.max_message_len,
            outbox_capacity: self.limits.outbox_capacity,
            heartbeat_ms: u32::try_from(self.heartbeat.interval_ms).unwrap_or(u32::MAX),
        }
    }
}
