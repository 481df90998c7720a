//! Token patterns and IP/CIDR rules
//!
//! Both are validated when configuration is loaded, so matching itself never
//! fails: a token pattern either matches or it does not, and an IP rule is
//! always a well-formed address or CIDR block.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net};

/// Wildcard glyph in token patterns
pub const WILDCARD: char = '*';

// ============================================================================
// Errors
// ============================================================================

/// Invalid pattern or rule literal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// Token pattern was empty
    EmptyToken,
    /// Not an IP address or CIDR block
    InvalidIp(String),
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::EmptyToken => write!(f, "token pattern cannot be empty"),
            RuleError::InvalidIp(s) => write!(f, "invalid IP or CIDR: {}", s),
        }
    }
}

impl std::error::Error for RuleError {}

// ============================================================================
// Token Patterns
// ============================================================================

/// Token pattern where `*` matches any substring (including an empty one)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPattern(String);

impl TokenPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, RuleError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(RuleError::EmptyToken);
        }
        Ok(TokenPattern(pattern))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether `token` matches this pattern
    pub fn matches(&self, token: &str) -> bool {
        glob_match(&self.0, token)
    }
}

impl fmt::Display for TokenPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// True if any pattern in `patterns` matches `token`
pub fn any_token_matches(patterns: &[TokenPattern], token: &str) -> bool {
    patterns.iter().any(|p| p.matches(token))
}

fn glob_match(pattern: &str, subject: &str) -> bool {
    let parts: Vec<&str> = pattern.split(WILDCARD).collect();
    if parts.len() == 1 {
        return pattern == subject;
    }

    let last = parts.len() - 1;
    let Some(mut rest) = subject.strip_prefix(parts[0]) else {
        return false;
    };

    for part in &parts[1..last] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }

    // The suffix must fit in what is left, so it cannot overlap earlier parts
    rest.ends_with(parts[last])
}

// ============================================================================
// IP Rules
// ============================================================================

/// A single address or a CIDR block.
///
/// IPv4-mapped IPv6 literals are stored as IPv4, the form peers are
/// compared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRule {
    /// Exact address
    Addr(IpAddr),
    /// Network block; host bits of the literal are ignored when matching
    Cidr(IpNet),
}

impl IpRule {
    /// Check whether `ip` is this address or inside this block
    pub fn matches(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        match self {
            IpRule::Addr(addr) => *addr == ip,
            IpRule::Cidr(net) => net.contains(&ip),
        }
    }
}

impl FromStr for IpRule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RuleError::InvalidIp(s.to_string());

        if !s.contains('/') {
            let addr: IpAddr = s.parse().map_err(|_| invalid())?;
            return Ok(IpRule::Addr(addr.to_canonical()));
        }

        let net: IpNet = s.parse().map_err(|_| invalid())?;
        Ok(IpRule::Cidr(canonical_net(net)))
    }
}

/// Rewrite `::ffff:a.b.c.d/n` (n >= 96) as `a.b.c.d/(n - 96)`
fn canonical_net(net: IpNet) -> IpNet {
    let IpNet::V6(v6) = net else {
        return net;
    };
    match v6.addr().to_ipv4_mapped() {
        Some(v4) if v6.prefix_len() >= 96 => Ipv4Net::new(v4, v6.prefix_len() - 96)
            .map(IpNet::V4)
            .unwrap_or(net),
        _ => net,
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpRule::Addr(addr) => write!(f, "{}", addr),
            IpRule::Cidr(net) => write!(f, "{}", net),
        }
    }
}

/// True if any rule in `rules` matches `ip`
pub fn any_ip_matches(rules: &[IpRule], ip: IpAddr) -> bool {
    rules.iter().any(|r| r.matches(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(s: &str) -> TokenPattern {
        TokenPattern::new(s).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn rule(s: &str) -> IpRule {
        s.parse().unwrap()
    }

    // ---- token patterns ----

    #[test]
    fn test_prefix_wildcard() {
        let p = pat("svc-*");
        assert!(p.matches("svc-prod"));
        assert!(p.matches("svc-"));
        assert!(!p.matches("other"));
        assert!(!p.matches("svc"));
    }

    #[test]
    fn test_exact_pattern() {
        let p = pat("abc");
        assert!(p.matches("abc"));
        assert!(!p.matches("abcd"));
        assert!(!p.matches("xabc"));
        assert!(!p.matches(""));
    }

    #[test]
    fn test_wildcard_positions() {
        assert!(pat("*").matches(""));
        assert!(pat("*").matches("anything"));
        assert!(pat("*-prod").matches("svc-prod"));
        assert!(!pat("*-prod").matches("svc-dev"));
        assert!(pat("a*b*c").matches("abc"));
        assert!(pat("a*b*c").matches("a-x-b-y-c"));
        assert!(!pat("a*b*c").matches("acb"));
    }

    #[test]
    fn test_suffix_does_not_overlap_prefix() {
        assert!(!pat("a*ab").matches("ab"));
        assert!(pat("a*ab").matches("aab"));
        assert!(!pat("*a*a").matches("a"));
        assert!(pat("*a*a").matches("aa"));
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert_eq!(TokenPattern::new(""), Err(RuleError::EmptyToken));
    }

    #[test]
    fn test_any_token_matches() {
        let patterns = vec![pat("abc"), pat("svc-*")];
        assert!(any_token_matches(&patterns, "svc-x"));
        assert!(!any_token_matches(&patterns, "nope"));
        assert!(!any_token_matches(&[], "abc"));
    }

    // ---- IP rules ----

    #[test]
    fn test_exact_ip_rule() {
        let r = rule("192.168.1.10");
        assert!(r.matches(ip("192.168.1.10")));
        assert!(!r.matches(ip("192.168.1.11")));
    }

    #[test]
    fn test_cidr_v4() {
        let r = rule("10.0.0.0/8");
        assert!(r.matches(ip("10.255.1.2")));
        assert!(!r.matches(ip("11.0.0.1")));
        assert!(rule("0.0.0.0/0").matches(ip("8.8.8.8")));
        assert!(rule("1.2.3.4/32").matches(ip("1.2.3.4")));
        assert!(!rule("1.2.3.4/32").matches(ip("1.2.3.5")));
    }

    #[test]
    fn test_cidr_host_bits_ignored() {
        assert!(rule("192.168.1.77/24").matches(ip("192.168.1.1")));
    }

    #[test]
    fn test_cidr_v6() {
        let r = rule("2001:db8::/32");
        assert!(r.matches(ip("2001:db8:1::5")));
        assert!(!r.matches(ip("2001:db9::1")));
        assert!(!r.matches(ip("10.0.0.1")));
    }

    #[test]
    fn test_mapped_v4_peer_matches_v4_rule() {
        assert!(rule("127.0.0.0/8").matches(ip("::ffff:127.0.0.1")));
        assert!(rule("127.0.0.1").matches(ip("::ffff:127.0.0.1")));
    }

    #[test]
    fn test_mapped_v6_rule_matches_v4_peer() {
        let r = rule("::ffff:10.0.0.0/104");
        assert_eq!(r, rule("10.0.0.0/8"));
        assert!(r.matches(ip("10.1.2.3")));
        assert!(r.matches(ip("::ffff:10.1.2.3")));
        assert!(!r.matches(ip("11.0.0.1")));
        assert!(rule("::ffff:192.0.2.1").matches(ip("192.0.2.1")));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        for s in ["", "abc", "10.0.0.0/33", "::/129", "10.0.0/8", "10.0.0.0/x", "1.2.3.4/"] {
            assert!(s.parse::<IpRule>().is_err(), "{} accepted", s);
        }
    }

    #[test]
    fn test_display_roundtrip_text() {
        assert_eq!(rule("10.0.0.0/8").to_string(), "10.0.0.0/8");
        assert_eq!(rule("::1").to_string(), "::1");
    }
}
