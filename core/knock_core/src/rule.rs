//! Validated forwarding rules and process-wide access policy

use std::net::SocketAddr;
use std::time::Duration;

use crate::pattern::{IpRule, TokenPattern};

/// Default grant lifetime when a rule does not set one
pub const DEFAULT_GRANT_LIFETIME: Duration = Duration::from_secs(3600);

/// One listening address forwarded to one backend, with its access policy
#[derive(Debug, Clone)]
pub struct ForwardRule {
    /// Listening address of the forwarding gate
    pub bind_addr: SocketAddr,
    /// Backend address admitted connections are proxied to
    pub forward_addr: SocketAddr,
    /// Tokens that may unlock this rule
    pub allow_tokens: Vec<TokenPattern>,
    /// Sources that are always admitted, never expire
    pub allow_ips: Vec<IpRule>,
    /// How long an unauthorized connection is held before closing
    pub drop_delay: Duration,
    /// How long a successful handshake admits its source IP
    pub grant_lifetime: Duration,
    /// Cap on concurrently proxied connections (None = unlimited)
    pub max_connections: Option<u32>,
}

impl ForwardRule {
    /// Rule with no patterns, no delay and the default grant lifetime
    pub fn new(bind_addr: SocketAddr, forward_addr: SocketAddr) -> Self {
        ForwardRule {
            bind_addr,
            forward_addr,
            allow_tokens: Vec::new(),
            allow_ips: Vec::new(),
            drop_delay: Duration::ZERO,
            grant_lifetime: DEFAULT_GRANT_LIFETIME,
            max_connections: None,
        }
    }

    /// Port handshakes must name to unlock this rule
    pub fn port(&self) -> u16 {
        self.bind_addr.port()
    }
}

/// Policy applied across every rule
#[derive(Debug, Clone, Default)]
pub struct GlobalPolicy {
    /// Tokens that unlock any rule on the requested port
    pub allow_tokens: Vec<TokenPattern>,
    /// Sources admitted to every rule
    pub allow_ips: Vec<IpRule>,
    /// Sources refused by every rule, overriding everything else
    pub deny_ips: Vec<IpRule>,
}
