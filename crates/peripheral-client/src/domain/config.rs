//! Client configuration schema.
//!
//! Every field has a serde default, so an empty file (or no file at all) is a
//! valid configuration:
//!
//! ```toml
//! endpoint = "ws://127.0.0.1:9100/stomp"
//! host = "localhost"
//! connect_timeout_ms = 10000
//!
//! [heartbeat]
//! outgoing_ms = 10000
//! incoming_ms = 10000
//!
//! [reconnect]
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! multiplier = 2.0
//! max_attempts = 5
//!
//! [payment]
//! cancel_grace_ms = 2000
//! ```
//!
//! # Milliseconds in the file, `Duration` in code (for beginners)
//!
//! TOML has no duration type, so the file stores plain integers with an `_ms`
//! suffix.  The accessor methods ([`ClientConfig::connect_timeout`] and
//! friends) convert them into `std::time::Duration` so the rest of the crate
//! never handles raw millisecond counts.

use std::time::Duration;

use peripheral_core::HeartBeat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::transport::backoff::ReconnectPolicy;
use crate::infrastructure::transport::TransportConfig;

/// Error type for loading, saving and validating the client configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field holds a value the client cannot run with.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// WebSocket URL of the bridge's STOMP endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Value of the `host` header in the CONNECT frame.
    #[serde(default = "default_host")]
    pub host: String,
    /// Upper bound for one connect attempt (socket + STOMP handshake).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
}

/// The client's `heart-beat` announcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    /// How often the client can send heart-beats.  0 disables sending.
    #[serde(default = "default_heartbeat_ms")]
    pub outgoing_ms: u64,
    /// How often the client wants to hear from the bridge.  0 disables the
    /// read timeout.
    #[serde(default = "default_heartbeat_ms")]
    pub incoming_ms: u64,
}

/// Exponential backoff for connect and reconnect attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Attempts per connect call, and per outage when reconnecting.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Payment facade settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentConfig {
    /// How long `cancel()` waits for the bridge to confirm before settling
    /// the pending collect locally.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_endpoint() -> String {
    "ws://127.0.0.1:9100/stomp".to_string()
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_heartbeat_ms() -> u64 {
    10_000
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    5
}
fn default_cancel_grace_ms() -> u64 {
    2_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            host: default_host(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            payment: PaymentConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            outgoing_ms: default_heartbeat_ms(),
            incoming_ms: default_heartbeat_ms(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl ClientConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] for values that fail [`validate`](Self::validate).
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let cfg: ClientConfig = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the values serde cannot check on its own.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                field: "endpoint",
                reason: format!("{:?} must start with ws:// or wss://", self.endpoint),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "connect_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(self.reconnect.multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                field: "reconnect.multiplier",
                reason: format!("{} is below 1.0", self.reconnect.multiplier),
            });
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "reconnect.max_attempts",
                reason: "must allow at least one attempt".to_string(),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.payment.cancel_grace_ms)
    }

    pub fn heart_beat(&self) -> HeartBeat {
        HeartBeat::new(self.heartbeat.outgoing_ms, self.heartbeat.incoming_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            multiplier: self.reconnect.multiplier,
            max_attempts: self.reconnect.max_attempts,
        }
    }

    /// The subset of settings the transport needs.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            endpoint: self.endpoint.clone(),
            host: self.host.clone(),
            connect_timeout: self.connect_timeout(),
            heart_beat: self.heart_beat(),
            reconnect: self.reconnect_policy(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
