//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! It is built from defaults, optionally overlaid with a TOML file, and then
//! overlaid with CLI arguments / `REMISE_*` environment variables in
//! `main.rs`.
//!
//! ```toml
//! bind_addr = "0.0.0.0:80"
//! log_level = "info"
//! max_message_size = 65536
//!
//! [ota]
//! ack_timeout_secs = 5
//! idle_timeout_secs = 5
//! image_dir = "./firmware"
//! max_image_size = 4194304
//!
//! [relay.z21]
//! endpoint = "127.0.0.1:21105"
//! max_sessions = 4
//!
//! [relay.zusi]
//! endpoint = "127.0.0.1:21106"
//! max_sessions = 1
//! exclusive_with_ota = true
//! ```
//!
//! Every field may be omitted.  Relay tables are resolved per kind, so a
//! `[relay.zusi]` table that only sets `endpoint` still gets the Zusi
//! defaults for everything else.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use remise_core::{DeviceEndpoint, GatePolicy, RelayKind, RelayPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for loading and validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// All runtime configuration for the bridge.
///
/// Build once at startup and wrap in an `Arc` to share across session tasks.
///
/// # Example
///
/// ```rust
/// use remise_bridge::domain::BridgeConfig;
///
/// let cfg = BridgeConfig::default();
/// assert_eq!(cfg.bind_addr.port(), 80);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// Address the WebSocket listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Default `tracing` level when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Largest WebSocket message accepted from a client, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub ota: OtaConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Firmware update channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtaConfig {
    /// How long to wait for the flasher's reply to one chunk.
    #[serde(default = "default_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// How long to wait for the client's next chunk after an ACK.
    #[serde(default = "default_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Directory the received image is written to.
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    /// Largest image the flasher accepts, in bytes.
    #[serde(default = "default_max_image_size")]
    pub max_image_size: u64,
}

/// Per-kind relay tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub z21: RelayEndpointConfig,
    #[serde(default)]
    pub zusi: RelayEndpointConfig,
}

/// Settings for one relay kind.  Unset fields take the kind's default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayEndpointConfig {
    /// UDP address of the device-native endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    /// Maximum simultaneous tunnels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
    /// Whether this kind and an OTA session exclude each other.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_with_ota: Option<bool>,
    /// Tunnel idle timeout; `0` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_message_size() -> usize {
    64 * 1024
}
fn default_timeout_secs() -> u64 {
    5
}
fn default_image_dir() -> PathBuf {
    PathBuf::from("./firmware")
}
fn default_max_image_size() -> u64 {
    4 * 1024 * 1024
}

fn default_relay_endpoint(kind: RelayKind) -> SocketAddr {
    let port = match kind {
        RelayKind::Z21 => 21105,
        RelayKind::Zusi => 21106,
    };
    SocketAddr::from(([127, 0, 0, 1], port))
}

impl Default for BridgeConfig {
    /// | Field            | Default        |
    /// |------------------|----------------|
    /// | bind_addr        | `0.0.0.0:80`   |
    /// | log_level        | `info`         |
    /// | max_message_size | 64 KiB         |
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
            max_message_size: default_max_message_size(),
            ota: OtaConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: default_timeout_secs(),
            idle_timeout_secs: default_timeout_secs(),
            image_dir: default_image_dir(),
            max_image_size: default_max_image_size(),
        }
    }
}

// ── Loading and resolution ────────────────────────────────────────────────────

impl BridgeConfig {
    /// Reads and validates a TOML configuration file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Parse`]
    /// for malformed TOML, [`ConfigError::Invalid`] for out-of-range values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be > 0".into()));
        }
        if self.ota.ack_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ota.ack_timeout_secs must be > 0".into()));
        }
        if self.ota.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ota.idle_timeout_secs must be > 0".into()));
        }
        if self.ota.max_image_size == 0 {
            return Err(ConfigError::Invalid("ota.max_image_size must be > 0".into()));
        }
        Ok(())
    }

    pub fn ota_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ota.ack_timeout_secs)
    }

    pub fn ota_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ota.idle_timeout_secs)
    }

    fn relay_table(&self, kind: RelayKind) -> &RelayEndpointConfig {
        match kind {
            RelayKind::Z21 => &self.relay.z21,
            RelayKind::Zusi => &self.relay.zusi,
        }
    }

    /// Device-native endpoint for `kind`.
    pub fn endpoint(&self, kind: RelayKind) -> DeviceEndpoint {
        DeviceEndpoint {
            kind,
            addr: self
                .relay_table(kind)
                .endpoint
                .unwrap_or_else(|| default_relay_endpoint(kind)),
        }
    }

    /// Tunnel idle timeout for `kind`, `None` when disabled.
    pub fn relay_idle_timeout(&self, kind: RelayKind) -> Option<Duration> {
        let secs = self
            .relay_table(kind)
            .idle_timeout_secs
            .unwrap_or_else(default_timeout_secs);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Gate policy assembled from the relay tables.
    pub fn gate_policy(&self) -> GatePolicy {
        let defaults = GatePolicy::default();
        let resolve = |kind: RelayKind| {
            let table = self.relay_table(kind);
            let fallback = defaults.relay(kind);
            RelayPolicy {
                max_sessions: table.max_sessions.unwrap_or(fallback.max_sessions),
                exclusive_with_ota: table
                    .exclusive_with_ota
                    .unwrap_or(fallback.exclusive_with_ota),
            }
        };
        GatePolicy {
            z21: resolve(RelayKind::Z21),
            zusi: resolve(RelayKind::Zusi),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
