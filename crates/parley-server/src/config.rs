//! Server configuration.
//!
//! Configuration is read once at startup from, in increasing priority:
//! - Built-in defaults
//! - A TOML file (`PARLEY_CONFIG`, or the first of the standard paths that exists)
//! - Environment variables (`PARLEY_PORT`, `PARLEY_STORE__URL`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Paths searched for a config file when `PARLEY_CONFIG` is unset.
const CONFIG_PATHS: &[&str] = &[
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

/// `store.url` value selecting the in-memory stores.
pub const MEMORY_STORE_URL: &str = "memory";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Durable store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Cross-origin policy.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Credential hashing.
    #[serde(default)]
    pub auth: AuthConfig,

    /// WebSocket transport.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Durable store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite URL, or `"memory"` for the in-memory stores.
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Maximum pooled connections.
    #[serde(default = "default_store_connections")]
    pub max_connections: u32,

    /// Mark every identity offline at startup.
    #[serde(default = "default_true")]
    pub reset_presence_on_start: bool,
}

/// CORS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// The single client origin allowed to call the API with credentials.
    /// Any origin is allowed, without credentials, when unset.
    #[serde(default)]
    pub allowed_origin: Option<String>,
}

/// Credential hashing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// bcrypt work factor (4..=31).
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
}

/// WebSocket transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Capacity of the status broadcast channel.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
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
    5000
}

fn default_true() -> bool {
    true
}

fn default_store_url() -> String {
    "sqlite://parley.db".to_string()
}

fn default_store_connections() -> u32 {
    8
}

fn default_bcrypt_cost() -> u32 {
    10
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            store: StoreConfig::default(),
            cors: CorsConfig::default(),
            auth: AuthConfig::default(),
            transport: TransportConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_connections: default_store_connections(),
            reset_presence_on_start: true,
        }
    }
}

impl StoreConfig {
    /// Whether the in-memory stores are selected.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.url == MEMORY_STORE_URL
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bcrypt_cost: default_bcrypt_cost(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            broadcast_capacity: default_broadcast_capacity(),
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
    /// Load configuration from file and environment, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let base = match Self::locate()? {
            Some(path) => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        let settings = config::Config::builder()
            .add_source(
                config::Config::try_from(&base).context("Failed to layer configuration")?,
            )
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a single TOML file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Find the config file to use, if any.
    fn locate() -> Result<Option<PathBuf>> {
        if let Ok(explicit) = std::env::var("PARLEY_CONFIG") {
            let path = PathBuf::from(shellexpand::tilde(&explicit).as_ref());
            anyhow::ensure!(path.exists(), "Config file not found: {}", path.display());
            return Ok(Some(path));
        }

        Ok(CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists()))
    }

    /// Reject values that would only fail later at runtime.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (4..=31).contains(&self.auth.bcrypt_cost),
            "auth.bcrypt_cost must be between 4 and 31, got {}",
            self.auth.bcrypt_cost
        );
        anyhow::ensure!(
            self.transport.websocket_path.starts_with('/'),
            "transport.websocket_path must start with '/'"
        );
        anyhow::ensure!(
            self.transport.broadcast_capacity > 0,
            "transport.broadcast_capacity must be positive"
        );
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}
