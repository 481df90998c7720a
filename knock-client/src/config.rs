//! Client configuration file

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use knock_core::config::{read_json, resolve_addr};
use knock_core::host::ServiceOption;
use knock_core::ConfigError;

/// Default config file name, looked up next to the executable
pub const DEFAULT_CONFIG_FILE: &str = "client_config.json";

/// Handshake interval when none is configured
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Shortest allowed handshake interval
pub const MIN_INTERVAL_SECS: u64 = 10;

// ============================================================================
// File Schema
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub log_level: String,
    pub service: ServiceOption,
    pub servers: Vec<ServerEntry>,
}

/// One knock server and the handshakes sent to it
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerEntry {
    /// Server auth address, `host:port`
    pub addr: String,
    /// Shared secret
    pub key: String,
    pub auth_configs: Vec<AuthConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: String,
    /// Forwarded port to unlock
    pub port: u16,
    /// Seconds between handshakes, default 60, minimum 10
    pub interval_secs: Option<u64>,
}

// ============================================================================
// Validated Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub servers: Vec<ServerTarget>,
}

#[derive(Debug, Clone)]
pub struct ServerTarget {
    /// Auth address as configured, re-resolved on every send
    pub addr: String,
    pub key: Vec<u8>,
    pub entries: Vec<AuthEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEntry {
    pub token: String,
    pub port: u16,
    pub interval: Duration,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(ConfigError::Parse)
    }

    pub fn validate(&self) -> Result<ClientSettings, ConfigError> {
        let servers = self
            .servers
            .iter()
            .enumerate()
            .map(|(i, server)| server.validate(&format!("servers[{}]", i)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClientSettings { servers })
    }
}

impl ServerEntry {
    fn validate(&self, field: &str) -> Result<ServerTarget, ConfigError> {
        resolve_addr(&format!("{}.addr", field), &self.addr)?;
        if self.key.is_empty() {
            return Err(ConfigError::invalid(format!("{}.key", field), "cannot be empty"));
        }

        let mut entries = Vec::with_capacity(self.auth_configs.len());
        for (i, auth) in self.auth_configs.iter().enumerate() {
            let field = format!("{}.auth_configs[{}]", field, i);
            if auth.token.is_empty() {
                return Err(ConfigError::invalid(format!("{}.token", field), "cannot be empty"));
            }
            let interval_secs = auth.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS);
            if interval_secs < MIN_INTERVAL_SECS {
                return Err(ConfigError::invalid(
                    format!("{}.interval_secs", field),
                    format!("must be at least {}", MIN_INTERVAL_SECS),
                ));
            }
            // Port 0 is left to the sender, which stops that entry
            entries.push(AuthEntry {
                token: auth.token.clone(),
                port: auth.port,
                interval: Duration::from_secs(interval_secs),
            });
        }

        Ok(ServerTarget {
            addr: self.addr.clone(),
            key: self.key.as_bytes().to_vec(),
            entries,
        })
    }
}
