//! Server configuration file
//!
//! JSON, loaded once at startup. Any invalid field aborts startup; the
//! server never runs with a partially valid rule set.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use knock_core::config::{parse_ip_rules, parse_token_patterns, read_json, resolve_addr};
use knock_core::host::ServiceOption;
use knock_core::{ConfigError, ForwardRule, GlobalPolicy};

/// Default config file name, looked up next to the executable
pub const DEFAULT_CONFIG_FILE: &str = "server_config.json";

/// Default grant lifetime in seconds
pub const DEFAULT_GRANT_LIFETIME_SECS: u64 = 3600;

// ============================================================================
// File Schema
// ============================================================================

/// Raw server configuration as written in the file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
    pub service: ServiceOption,
    /// UDP address handshakes are received on
    pub auth_addr: String,
    /// Shared secret for the handshake cipher
    pub auth_key: String,
    pub forward_rules: Vec<ForwardRuleConfig>,
    /// Tokens accepted by every rule, `*` for wildcard
    pub global_allow_tokens: Vec<String>,
    /// Sources admitted by every rule, IP or CIDR
    pub global_allow_ips: Vec<String>,
    /// Sources refused by every rule, IP or CIDR
    pub global_deny_ips: Vec<String>,
}

/// Raw forwarding rule as written in the file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ForwardRuleConfig {
    /// Listening address, e.g. `0.0.0.0:80`
    pub bind_addr: String,
    /// Backend address, e.g. `127.0.0.1:8080`
    pub forward_addr: String,
    /// Tokens that unlock this rule, `*` for wildcard
    pub allow_tokens: Vec<String>,
    /// Sources always admitted to this rule, IP or CIDR
    pub allow_ips: Vec<String>,
    /// Milliseconds before an unauthorized connection is closed, 0 = immediately
    pub drop_delay_ms: u64,
    /// Seconds a handshake admits its source, default 3600
    pub grant_lifetime_secs: Option<u64>,
    /// Concurrent proxied connection cap, 0 or absent = unlimited
    pub max_connections: Option<u32>,
}

// ============================================================================
// Validated Settings
// ============================================================================

/// Everything the server needs, validated
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub auth_addr: SocketAddr,
    pub auth_key: Vec<u8>,
    pub rules: Vec<ForwardRule>,
    pub global: GlobalPolicy,
}

impl ServerConfig {
    /// Read a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    /// Parse config JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(ConfigError::Parse)
    }

    /// Validate every field and build the runtime settings
    pub fn validate(&self) -> Result<ServerSettings, ConfigError> {
        let auth_addr: SocketAddr = self
            .auth_addr
            .parse()
            .map_err(|e| ConfigError::invalid("auth_addr", format!("{}", e)))?;
        if self.auth_key.is_empty() {
            return Err(ConfigError::invalid("auth_key", "cannot be empty"));
        }

        let rules = self
            .forward_rules
            .iter()
            .enumerate()
            .map(|(i, rule)| rule.validate(&format!("forward_rules[{}]", i)))
            .collect::<Result<Vec<_>, _>>()?;

        let global = GlobalPolicy {
            allow_tokens: parse_token_patterns("global_allow_tokens", &self.global_allow_tokens)?,
            allow_ips: parse_ip_rules("global_allow_ips", &self.global_allow_ips)?,
            deny_ips: parse_ip_rules("global_deny_ips", &self.global_deny_ips)?,
        };

        Ok(ServerSettings {
            auth_addr,
            auth_key: self.auth_key.as_bytes().to_vec(),
            rules,
            global,
        })
    }
}

impl ForwardRuleConfig {
    fn validate(&self, field: &str) -> Result<ForwardRule, ConfigError> {
        let bind_field = format!("{}.bind_addr", field);
        if self.bind_addr.is_empty() {
            return Err(ConfigError::invalid(bind_field, "cannot be empty"));
        }
        let bind_addr: SocketAddr = self
            .bind_addr
            .parse()
            .map_err(|e| ConfigError::invalid(&bind_field, format!("{}", e)))?;
        if bind_addr.port() == 0 || bind_addr.port() == u16::MAX {
            return Err(ConfigError::invalid(bind_field, "port allow range 1~65534"));
        }

        let forward_addr = resolve_addr(&format!("{}.forward_addr", field), &self.forward_addr)?;

        let grant_lifetime_secs = self.grant_lifetime_secs.unwrap_or(DEFAULT_GRANT_LIFETIME_SECS);
        if grant_lifetime_secs == 0 {
            return Err(ConfigError::invalid(
                format!("{}.grant_lifetime_secs", field),
                "must be greater than 0",
            ));
        }

        Ok(ForwardRule {
            bind_addr,
            forward_addr,
            allow_tokens: parse_token_patterns(&format!("{}.allow_tokens", field), &self.allow_tokens)?,
            allow_ips: parse_ip_rules(&format!("{}.allow_ips", field), &self.allow_ips)?,
            drop_delay: Duration::from_millis(self.drop_delay_ms),
            grant_lifetime: Duration::from_secs(grant_lifetime_secs),
            max_connections: self.max_connections.filter(|max| *max > 0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "log_level": "info",
        "service": { "name": "knock-server" },
        "auth_addr": "0.0.0.0:7000",
        "auth_key": "secret",
        "forward_rules": [
            {
                "bind_addr": "0.0.0.0:8080",
                "forward_addr": "127.0.0.1:80",
                "allow_tokens": ["svc-*"],
                "allow_ips": ["10.0.0.0/8"],
                "drop_delay_ms": 500,
                "max_connections": 4
            },
            { "bind_addr": "[::]:2222", "forward_addr": "127.0.0.1:22", "grant_lifetime_secs": 60 }
        ],
        "global_allow_tokens": ["admin"],
        "global_deny_ips": ["192.0.2.0/24"]
    }"#;

    fn invalid_field(config: &ServerConfig) -> String {
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => field,
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_sample_config() {
        let config = ServerConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.service.name, "knock-server");

        let settings = config.validate().unwrap();
        assert_eq!(settings.auth_addr, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(settings.auth_key, b"secret");
        assert_eq!(settings.rules.len(), 2);

        let first = &settings.rules[0];
        assert_eq!(first.port(), 8080);
        assert_eq!(first.drop_delay, Duration::from_millis(500));
        assert_eq!(first.grant_lifetime, Duration::from_secs(DEFAULT_GRANT_LIFETIME_SECS));
        assert_eq!(first.max_connections, Some(4));
        assert!(first.allow_tokens[0].matches("svc-a"));

        let second = &settings.rules[1];
        assert_eq!(second.port(), 2222);
        assert_eq!(second.drop_delay, Duration::ZERO);
        assert_eq!(second.grant_lifetime, Duration::from_secs(60));
        assert_eq!(second.max_connections, None);

        assert_eq!(settings.global.allow_tokens.len(), 1);
        assert_eq!(settings.global.deny_ips.len(), 1);
    }

    #[test]
    fn test_zero_max_connections_is_unlimited() {
        let mut config = ServerConfig::from_json(SAMPLE).unwrap();
        config.forward_rules[0].max_connections = Some(0);
        assert_eq!(config.validate().unwrap().rules[0].max_connections, None);
    }

    #[test]
    fn test_missing_key_rejected() {
        let mut config = ServerConfig::from_json(SAMPLE).unwrap();
        config.auth_key.clear();
        assert_eq!(invalid_field(&config), "auth_key");
    }

    #[test]
    fn test_bad_auth_addr_rejected() {
        let mut config = ServerConfig::from_json(SAMPLE).unwrap();
        config.auth_addr = "nope".to_string();
        assert_eq!(invalid_field(&config), "auth_addr");
    }

    #[test]
    fn test_bind_port_range() {
        let mut config = ServerConfig::from_json(SAMPLE).unwrap();
        config.forward_rules[1].bind_addr = "0.0.0.0:65535".to_string();
        assert_eq!(invalid_field(&config), "forward_rules[1].bind_addr");
        config.forward_rules[1].bind_addr = "0.0.0.0:0".to_string();
        assert_eq!(invalid_field(&config), "forward_rules[1].bind_addr");
    }

    #[test]
    fn test_empty_forward_addr_rejected() {
        let mut config = ServerConfig::from_json(SAMPLE).unwrap();
        config.forward_rules[0].forward_addr.clear();
        assert_eq!(invalid_field(&config), "forward_rules[0].forward_addr");
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let mut config = ServerConfig::from_json(SAMPLE).unwrap();
        config.forward_rules[0].allow_ips.push("10.0.0.0/40".to_string());
        assert_eq!(invalid_field(&config), "forward_rules[0].allow_ips[1]");

        let mut config = ServerConfig::from_json(SAMPLE).unwrap();
        config.global_deny_ips = vec!["not-an-ip".to_string()];
        assert_eq!(invalid_field(&config), "global_deny_ips[0]");
    }

    #[test]
    fn test_empty_token_rejected() {
        let mut config = ServerConfig::from_json(SAMPLE).unwrap();
        config.global_allow_tokens.push(String::new());
        assert_eq!(invalid_field(&config), "global_allow_tokens[1]");
    }

    #[test]
    fn test_zero_grant_lifetime_rejected() {
        let mut config = ServerConfig::from_json(SAMPLE).unwrap();
        config.forward_rules[1].grant_lifetime_secs = Some(0);
        assert_eq!(invalid_field(&config), "forward_rules[1].grant_lifetime_secs");
    }

    #[test]
    fn test_unparseable_json() {
        assert!(matches!(ServerConfig::from_json("{"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            ServerConfig::from_json(r#"{"forward_rules": 5}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
