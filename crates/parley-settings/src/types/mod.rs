//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file may name any subset of keys and the rest keep their defaults.

mod server;

pub use server::*;

use parley_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the relay.
///
/// ```json
/// {
///   "server": { "port": 3006, "heartbeatIntervalSecs": 30 },
///   "logging": { "level": "debug", "format": "json" },
///   "signaling": { "forwardUnknownTypes": false }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    /// Listener and connection settings.
    pub server: ServerSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
    /// Message routing behavior.
    pub signaling: SignalingSettings,
}

impl ParleySettings {
    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.host.trim().is_empty() {
            return Err(SettingsError::invalid("server.host", "must not be empty"));
        }
        if server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::invalid(
                "server.heartbeatIntervalSecs",
                "must be at least 1",
            ));
        }
        if server.heartbeat_timeout_secs < server.heartbeat_interval_secs {
            return Err(SettingsError::invalid(
                "server.heartbeatTimeoutSecs",
                format!(
                    "{} is shorter than server.heartbeatIntervalSecs ({})",
                    server.heartbeat_timeout_secs, server.heartbeat_interval_secs
                ),
            ));
        }
        if server.send_queue_capacity == 0 {
            return Err(SettingsError::invalid(
                "server.sendQueueCapacity",
                "must be at least 1",
            ));
        }
        if server.max_connections == 0 {
            return Err(SettingsError::invalid(
                "server.maxConnections",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Output format for stderr.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Message routing behavior.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalingSettings {
    /// Relay messages of unrecognized type that carry a `to` field instead
    /// of dropping them.
    pub forward_unknown_types: bool,
}
