//! Configuration loading helpers shared by server and client
//!
//! Every validation failure names the offending field, e.g.
//! `forward_rules[2].allow_ips[0]`, so a broken file is easy to fix.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::pattern::{IpRule, TokenPattern};

// ============================================================================
// Errors
// ============================================================================

/// Errors while reading or validating a configuration file
#[derive(Debug)]
pub enum ConfigError {
    /// File could not be read
    Io { path: PathBuf, source: io::Error },
    /// File is not valid JSON for the expected schema
    Parse(serde_json::Error),
    /// A field failed validation
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "read config file {} failed: {}", path.display(), source)
            }
            ConfigError::Parse(e) => write!(f, "parse config failed: {}", e),
            ConfigError::Invalid { field, reason } => write!(f, "{}: {}", field, reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid { .. } => None,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Read and deserialize a JSON configuration file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(ConfigError::Parse)
}

/// Path of `file_name` next to the running executable, falling back to the
/// working directory
pub fn default_path(file_name: &str) -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(file_name)))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

/// Resolve `value` (host:port or ip:port) to its first socket address
pub fn resolve_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::invalid(field, "cannot be empty"));
    }
    value
        .to_socket_addrs()
        .map_err(|e| ConfigError::invalid(field, format!("cannot resolve {}: {}", value, e)))?
        .next()
        .ok_or_else(|| ConfigError::invalid(field, format!("{} resolved to no address", value)))
}

/// Parse a list of IP/CIDR literals
pub fn parse_ip_rules(field: &str, values: &[String]) -> Result<Vec<IpRule>, ConfigError> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.parse()
                .map_err(|e| ConfigError::invalid(format!("{}[{}]", field, i), format!("{}", e)))
        })
        .collect()
}

/// Parse a list of token patterns
pub fn parse_token_patterns(
    field: &str,
    values: &[String],
) -> Result<Vec<TokenPattern>, ConfigError> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            TokenPattern::new(v.clone())
                .map_err(|e| ConfigError::invalid(format!("{}[{}]", field, i), format!("{}", e)))
        })
        .collect()
}
